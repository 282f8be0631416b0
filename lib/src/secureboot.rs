//! # Secure boot signing
//!
//! Immutable images have their UKI and bootloader signed with the secure boot DB
//! key.  Each artifact is signed into a `.signed` sibling which then replaces
//! the original, so an artifact is either fully signed or untouched.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::bootloader::BOOTLOADER_EFI;
use crate::error::InstallError;
use crate::install::InstallationContext;
use crate::task::Task;
use crate::template::{nonempty_path, ImageTemplate, ImmutabilityConfig};
use crate::uki::UKI_PATH;

const SIGNED_SUFFIX: &str = ".signed";
/// File name of the exported DB certificate
pub const EXPORTED_CERT: &str = "DB.cer";

/// Key material for signing.
#[derive(Debug, Clone, Copy)]
pub struct SecureBootMaterial<'a> {
    /// Private key
    pub key: &'a Utf8Path,
    /// PEM certificate used by the signer
    pub crt: &'a Utf8Path,
    /// DER certificate exported for enrollment
    pub cer: &'a Utf8Path,
}

impl<'a> SecureBootMaterial<'a> {
    /// The configured material; `None` if signing is not configured at all,
    /// i.e. immutability is disabled or any path is unset.
    pub fn from_config(config: &'a ImmutabilityConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            key: nonempty_path(&config.secure_boot_db_key)?,
            crt: nonempty_path(&config.secure_boot_db_crt)?,
            cer: nonempty_path(&config.secure_boot_db_cer)?,
        })
    }

    /// Fail unless every file exists.
    pub fn verify(&self) -> Result<()> {
        let mut missing = Vec::new();
        for p in [self.key, self.crt, self.cer] {
            if !p.try_exists().with_context(|| format!("Querying {p}"))? {
                missing.push(p.to_string());
            }
        }
        if !missing.is_empty() {
            return Err(InstallError::SigningPrerequisiteMissing { missing }.into());
        }
        Ok(())
    }
}

/// Sign a single artifact (relative to the root) in place.
fn sign_file(
    ctx: &InstallationContext,
    root: &Dir,
    material: &SecureBootMaterial,
    rel: &str,
) -> Result<()> {
    let signed_rel = format!("{rel}{SIGNED_SUFFIX}");
    let path = ctx.install_root().join(rel);
    let signed = ctx.install_root().join(&signed_rel);
    let r = Task::new(format!("Signing {rel}"), "sbsign")
        .privileged()
        .args([
            "--key",
            material.key.as_str(),
            "--cert",
            material.crt.as_str(),
            "--output",
            signed.as_str(),
            path.as_str(),
        ])
        .run(ctx.executor())
        .and_then(|_| {
            root.rename(&signed_rel, root, rel)
                .with_context(|| format!("Replacing {rel}"))
        });
    if let Err(e) = r {
        if let Err(rm) = root.remove_file_optional(&signed_rel) {
            tracing::warn!("Removing {signed_rel}: {rm}");
        }
        return Err(e.context(InstallError::SigningExecutionFailure { path }));
    }
    Ok(())
}

#[context("Exporting certificate")]
fn export_certificate(cer: &Utf8Path, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    std::fs::create_dir_all(dest_dir).with_context(|| format!("Creating {dest_dir}"))?;
    let dest = dest_dir.join(EXPORTED_CERT);
    std::fs::copy(cer, &dest).with_context(|| format!("Copying {cer} to {dest}"))?;
    Ok(dest)
}

/// Sign the UKI and the bootloader of an immutable image, then export the DB
/// certificate for enrollment.  Without complete signing configuration, this
/// does nothing.
pub fn sign_image(ctx: &InstallationContext, template: &ImageTemplate) -> Result<()> {
    let Some(material) = SecureBootMaterial::from_config(&template.system_config.immutability)
    else {
        tracing::debug!("Secure boot signing not configured");
        return Ok(());
    };
    material.verify()?;

    let root = ctx.open_root()?;
    let artifacts = [UKI_PATH, BOOTLOADER_EFI];
    for rel in artifacts {
        if !root.try_exists(rel)? {
            let path = ctx.install_root().join(rel);
            return Err(anyhow!("{path} not found"))
                .context(InstallError::SigningExecutionFailure { path });
        }
    }
    for rel in artifacts {
        sign_file(ctx, &root, &material, rel)?;
    }
    let dest_dir = ctx.imagebuild_dir(&template.system_config.name);
    let exported = export_certificate(material.cer, &dest_dir)?;
    tracing::info!("Signed boot artifacts; certificate exported to {exported}");
    Ok(())
}
