//! # Base OS configuration
//!
//! Hostname, network and additional files are written directly into the
//! mounted install root.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::{Dir, OpenOptions};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::template::{AdditionalFileInfo, NetworkConfig};

const ETC_HOSTNAME: &str = "etc/hostname";
const ETC_HOSTS: &str = "etc/hosts";
const NETWORK_DIR: &str = "etc/systemd/network";
const DEFAULT_NETWORK: &str = "99-default.network";

/// Create the parent directory of a root-relative path.
fn ensure_parent(root: &Dir, path: &Utf8Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        root.create_dir_all(parent)
            .with_context(|| format!("Creating {parent}"))?;
    }
    Ok(())
}

#[context("Setting hostname")]
pub(crate) fn write_hostname(root: &Dir, hostname: &str) -> Result<()> {
    root.create_dir_all("etc")?;
    root.atomic_write(ETC_HOSTNAME, format!("{hostname}\n"))?;
    let mut opts = OpenOptions::new();
    opts.append(true).create(true);
    let mut hosts = root.open_with(ETC_HOSTS, &opts)?;
    writeln!(hosts, "127.0.1.1 {hostname}")?;
    Ok(())
}

#[context("Configuring network")]
pub(crate) fn write_network(root: &Dir, network: &NetworkConfig) -> Result<()> {
    if !network.dhcp {
        return Ok(());
    }
    root.create_dir_all(NETWORK_DIR)?;
    let contents = format!(
        "[Match]\nName={}\n\n[Network]\nDHCP=yes\n",
        network.interface_match
    );
    root.atomic_write(format!("{NETWORK_DIR}/{DEFAULT_NETWORK}"), contents)?;
    Ok(())
}

/// Copy files from the build host into the root.
pub(crate) fn copy_additional_files(root: &Dir, files: &[AdditionalFileInfo]) -> Result<()> {
    for f in files {
        let dest = f.final_path.as_str().trim_start_matches('/');
        let dest = Utf8Path::new(dest);
        (|| {
            let contents = std::fs::read(&f.local).with_context(|| format!("Reading {}", f.local))?;
            ensure_parent(root, dest)?;
            root.atomic_write(dest, contents)?;
            anyhow::Ok(())
        })()
        .with_context(|| format!("Copying {} to {}", f.local, f.final_path))?;
        tracing::debug!("Copied {} to {}", f.local, f.final_path);
    }
    Ok(())
}
