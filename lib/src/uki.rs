//! # Unified kernel image
//!
//! The UKI bundles the installed kernel, a freshly generated initramfs and the
//! kernel command line into `/boot/efi/EFI/Linux/linux.efi`.

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::error::InstallError;
use crate::install::InstallationContext;
use crate::task::Task;
use crate::template::{ImageTemplate, PkgType};

/// Directory holding the UKI, relative to the install root
pub(crate) const UKI_DIR: &str = "boot/efi/EFI/Linux";
/// The UKI, relative to the install root
pub(crate) const UKI_PATH: &str = "boot/efi/EFI/Linux/linux.efi";
const UKI_TMP_PATH: &str = "boot/efi/EFI/Linux/linux.efi.tmp";
const KERNEL_PREFIX: &str = "vmlinuz-";
const KERNEL_CMDLINE_PATH: &str = "etc/kernel/cmdline";

const BASE_CMDLINE: &[&str] = &["console=ttyS0,115200", "console=tty0"];
const RW_KARG: &str = "rw";
const RO_KARG: &str = "ro";

/// The kernel command line for the image: the fixed console arguments, the root
/// mount mode, then template arguments, then configured extra arguments.
pub fn kernel_cmdline(ctx: &InstallationContext, template: &ImageTemplate) -> String {
    let mode = if template.system_config.immutability.enabled {
        RO_KARG
    } else {
        RW_KARG
    };
    let template_args = template.system_config.kernel.cmdline.split_whitespace();
    let config_args = ctx
        .config()
        .kernel_cmdline
        .iter()
        .flatten()
        .map(String::as_str);
    BASE_CMDLINE
        .iter()
        .copied()
        .chain(std::iter::once(mode))
        .chain(template_args)
        .chain(config_args)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Record the kernel command line in `/etc/kernel/cmdline`.
#[context("Writing kernel command line")]
pub(crate) fn write_kernel_cmdline(ctx: &InstallationContext, template: &ImageTemplate) -> Result<()> {
    let root = ctx.open_root()?;
    let cmdline = kernel_cmdline(ctx, template);
    root.create_dir_all("etc/kernel")?;
    root.atomic_write(KERNEL_CMDLINE_PATH, format!("{cmdline}\n"))?;
    Ok(())
}

/// Find the installed kernel version from `boot/vmlinuz-<version>`; with multiple
/// kernels, the first in name order wins.
#[context("Finding installed kernel")]
pub(crate) fn find_kernel_version(root: &Dir) -> Result<String> {
    let mut names = root
        .read_dir("boot")?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect::<Vec<_>>();
    names.sort();
    names
        .iter()
        .find_map(|n| n.strip_prefix(KERNEL_PREFIX).filter(|v| !v.is_empty()))
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow!("No {KERNEL_PREFIX}* found in /boot"))
}

/// Regenerate the initramfs for `kver`, returning its path inside the image.
fn regenerate_initramfs(ctx: &InstallationContext, pkg_type: PkgType, kver: &str) -> Result<String> {
    let root = ctx.install_root();
    let (task, initrd) = match pkg_type {
        PkgType::Deb => (
            Task::new(format!("Generating initramfs for {kver}"), "update-initramfs")
                .args(["-c", "-k", kver]),
            format!("/boot/initrd.img-{kver}"),
        ),
        PkgType::Rpm => {
            let initrd = format!("/boot/initramfs-{kver}.img");
            (
                Task::new(format!("Generating initramfs for {kver}"), "dracut")
                    .args(["--force", "--kver", kver, initrd.as_str()]),
                initrd,
            )
        }
    };
    task.chroot(root).run(ctx.executor())?;
    Ok(initrd)
}

/// Build the UKI, returning its path on the build host.
pub fn build_uki(ctx: &InstallationContext, template: &ImageTemplate) -> Result<Utf8PathBuf> {
    build_uki_impl(ctx, template).context(InstallError::UkiBuildFailure)
}

fn build_uki_impl(ctx: &InstallationContext, template: &ImageTemplate) -> Result<Utf8PathBuf> {
    let root = ctx.open_root()?;
    let install_root = ctx.install_root();
    let pkg_type = template.target.pkg_type()?;
    let kver = find_kernel_version(&root)?;
    tracing::debug!("Found kernel {kver}");
    let initrd = regenerate_initramfs(ctx, pkg_type, &kver)?;

    Task::new("Creating UKI directory", "mkdir")
        .quiet()
        .args(["-p".to_string(), format!("/{UKI_DIR}")])
        .chroot(install_root)
        .run(ctx.executor())?;

    let cmdline = kernel_cmdline(ctx, template);
    let r = Task::new(format!("Building unified kernel image for {kver}"), "ukify")
        .args(["build".to_string(), format!("--linux=/boot/{KERNEL_PREFIX}{kver}")])
        .args([
            format!("--initrd={initrd}"),
            format!("--cmdline={cmdline}"),
            format!("--output=/{UKI_TMP_PATH}"),
        ])
        .chroot(install_root)
        .run(ctx.executor())
        .and_then(|_| {
            root.rename(UKI_TMP_PATH, &root, UKI_PATH)
                .with_context(|| format!("Renaming {UKI_TMP_PATH}"))
        });
    if let Err(e) = r {
        if let Err(rm) = root.remove_file_optional(UKI_TMP_PATH) {
            tracing::warn!("Removing {UKI_TMP_PATH}: {rm}");
        }
        return Err(e);
    }
    let uki = install_root.join(UKI_PATH);
    tracing::info!("Built {uki}");
    Ok(uki)
}
