//! # Installing packages into the chroot
//!
//! Packages are installed one at a time, in a fixed order: anything named
//! `filesystem*` first since it lays out the base directory tree, anything named
//! `initramfs*` last so that the initramfs is generated with everything else present.

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::error::InstallError;
use crate::install::InstallationContext;
use crate::task::Task;
use crate::template::{ImageTemplate, PkgType, TargetInfo};

const HEAD_PREFIX: &str = "filesystem";
const TAIL_PREFIX: &str = "initramfs";

const DPKG_STATUS: &str = "var/lib/dpkg/status";
const DPKG_INFO: &str = "var/lib/dpkg/info";
const RPMDB: &str = "var/lib/rpm";

/// Return the packages in installation order; the relative order within each
/// group is preserved.
pub fn installation_order(packages: &[String]) -> Vec<&str> {
    let (head, rest): (Vec<_>, Vec<_>) = packages
        .iter()
        .map(String::as_str)
        .partition(|p| p.starts_with(HEAD_PREFIX));
    let (tail, middle): (Vec<_>, Vec<_>) = rest.into_iter().partition(|p| p.starts_with(TAIL_PREFIX));
    head.into_iter().chain(middle).chain(tail).collect()
}

/// The package manager driving installation into a chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PackageManager {
    /// apt, run inside the chroot
    Apt,
    /// dnf, run from the host against the install root
    Dnf,
}

impl PackageManager {
    pub(crate) fn for_target(target: &TargetInfo) -> Result<Self> {
        match target.pkg_type()? {
            PkgType::Deb => Ok(Self::Apt),
            PkgType::Rpm => Ok(Self::Dnf),
        }
    }

    /// Initialize the package database in the install root if it does not exist yet.
    pub(crate) fn init_db(&self, ctx: &InstallationContext) -> Result<()> {
        let root = ctx.open_root()?;
        match self {
            Self::Apt => init_dpkg_db(&root),
            Self::Dnf => {
                if root.try_exists(RPMDB)? {
                    return Ok(());
                }
                Task::new("Initializing rpm database", "rpm")
                    .privileged()
                    .args(["--root", ctx.install_root().as_str(), "--initdb"])
                    .run(ctx.executor())
                    .map(drop)
            }
        }
    }

    /// Install a single package.
    pub(crate) fn install(&self, ctx: &InstallationContext, pkg: &str) -> Result<()> {
        let task = match self {
            Self::Apt => Task::new(format!("Installing {pkg}"), "apt-get")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .args(["install", "-y", "--no-install-recommends", pkg])
                .chroot(ctx.install_root()),
            Self::Dnf => Task::new(format!("Installing {pkg}"), "dnf")
                .privileged()
                .args(["--installroot", ctx.install_root().as_str(), "-y", "install", pkg]),
        };
        task.run(ctx.executor()).map(drop)
    }
}

#[context("Initializing dpkg database")]
fn init_dpkg_db(root: &Dir) -> Result<()> {
    if root.try_exists(DPKG_STATUS)? {
        return Ok(());
    }
    root.create_dir_all(DPKG_INFO)?;
    root.atomic_write(DPKG_STATUS, "")?;
    Ok(())
}

/// Install every package of the template into the install root, aborting on
/// the first failure.  Already installed packages are left in place.
pub fn install_packages(ctx: &InstallationContext, template: &ImageTemplate) -> Result<()> {
    let pm = PackageManager::for_target(&template.target)?;
    let packages = installation_order(&template.system_config.packages);
    pm.init_db(ctx).context(InstallError::PackageInstallFailure {
        package: "package database".into(),
    })?;
    tracing::debug!("Installing {} packages", packages.len());
    for pkg in packages {
        pm.install(ctx, pkg)
            .with_context(|| InstallError::PackageInstallFailure {
                package: pkg.to_string(),
            })?;
    }
    Ok(())
}
