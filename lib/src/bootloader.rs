use anyhow::Result;
use fn_error_context::context;

use crate::install::InstallationContext;
use crate::mount::ESP_MOUNTPOINT;
use crate::task::Task;
use crate::template::{BootloaderProvider, ImageTemplate};

/// Path of the removable-media bootloader on the ESP, relative to the install root
pub(crate) const BOOTLOADER_EFI: &str = "boot/efi/EFI/BOOT/BOOTX64.EFI";

/// Map our architecture name to the one GRUB uses for its EFI target.
fn grub_efi_target(arch: &str) -> String {
    let arch = match arch {
        "amd64" => "x86_64",
        "aarch64" => "arm64",
        o => o,
    };
    format!("{arch}-efi")
}

#[context("Installing bootloader")]
pub(crate) fn install_bootloader(ctx: &InstallationContext, template: &ImageTemplate) -> Result<()> {
    let root = ctx.install_root();
    let task = match template.system_config.bootloader.provider {
        BootloaderProvider::SystemdBoot => {
            Task::new("Installing systemd-boot", "bootctl").args([
                "--no-variables".to_string(),
                format!("--esp-path={ESP_MOUNTPOINT}"),
                "install".to_string(),
            ])
        }
        BootloaderProvider::Grub => Task::new("Installing GRUB", "grub-install").args([
            format!("--target={}", grub_efi_target(&template.target.arch)),
            format!("--efi-directory={ESP_MOUNTPOINT}"),
            "--removable".to_string(),
            "--no-nvram".to_string(),
        ]),
        BootloaderProvider::None => {
            tracing::debug!("Skipping bootloader installation");
            return Ok(());
        }
    };
    task.chroot(root).run(ctx.executor())?;
    Ok(())
}
