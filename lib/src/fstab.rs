//! # Generating /etc/fstab
//!
//! Every provisioned partition gets one line referencing it by `PARTUUID`.

use std::fmt::Display;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::OpenOptions;
use fn_error_context::context;

use crate::error::InstallError;
use crate::install::InstallationContext;
use crate::mount::{compare_mount_points, DiskPathIdMap};
use crate::task::{Executor, Task};
use crate::template::{ImageTemplate, Partition};

const FSTAB: &str = "etc/fstab";
const SWAP: &str = "swap";
const SWAP_MOUNTPOINT: &str = "none";
const SWAP_OPTIONS: &str = "sw";
const DEFAULT_OPTIONS: &str = "defaults";

/// A single line of fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Partition UUID of the device
    pub partuuid: String,
    /// Mountpoint
    pub mount_point: String,
    /// Filesystem type
    pub fs_type: String,
    /// Mount options
    pub options: String,
    /// Whether dump(8) backs this up; always 0
    pub dump: u8,
    /// fsck pass number
    pub pass: u8,
}

impl FstabEntry {
    /// Build the entry for a partition with the given UUID.
    pub fn new(part: &Partition, partuuid: &str) -> Self {
        let fs_type = part.normalized_fs_type().to_string();
        let is_swap = fs_type == SWAP;
        let options = if is_swap {
            SWAP_OPTIONS.to_string()
        } else {
            part.mount_options
                .as_deref()
                .filter(|o| !o.is_empty())
                .unwrap_or(DEFAULT_OPTIONS)
                .to_string()
        };
        let mount_point = if is_swap {
            SWAP_MOUNTPOINT.to_string()
        } else {
            part.mount_point.clone()
        };
        let pass = match (mount_point.as_str(), is_swap) {
            ("/", _) => 1,
            (_, true) => 0,
            _ => 2,
        };
        Self {
            partuuid: partuuid.to_string(),
            mount_point,
            fs_type,
            options,
            dump: 0,
            pass,
        }
    }
}

impl Display for FstabEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PARTUUID={} {} {} {} {} {}",
            self.partuuid, self.mount_point, self.fs_type, self.options, self.dump, self.pass
        )
    }
}

/// Look up the partition UUID of a block device.
#[context("Querying PARTUUID of {device}")]
pub(crate) fn partuuid(executor: &dyn Executor, device: &Utf8Path) -> Result<String> {
    let out = Task::new(format!("Querying PARTUUID of {device}"), "blkid")
        .quiet()
        .privileged()
        .args(["-s", "PARTUUID", "-o", "value", device.as_str()])
        .run(executor)?;
    let uuid = out.trim();
    if uuid.is_empty() {
        return Err(anyhow!("No PARTUUID found"));
    }
    Ok(uuid.to_string())
}

/// Compute fstab entries for all provisioned partitions.  Mounted filesystems come
/// first in mount order, followed by swap in the order of `disk_paths`.
pub fn fstab_entries(
    ctx: &InstallationContext,
    disk_paths: &DiskPathIdMap,
    partitions: &[Partition],
) -> Result<Vec<FstabEntry>> {
    let mut r = Vec::new();
    for (id, device) in disk_paths.iter() {
        let part = partitions
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("No partition with ID {id} in template"))?;
        if !part.is_mountable() && part.normalized_fs_type() != SWAP {
            tracing::debug!("Partition {id} has no mountpoint; not adding to fstab");
            continue;
        }
        let uuid = partuuid(ctx.executor(), device)?;
        r.push(FstabEntry::new(part, &uuid));
    }
    let order = ctx.config().mount_order();
    r.sort_by(|a, b| {
        let a_swap = a.fs_type == SWAP;
        let b_swap = b.fs_type == SWAP;
        a_swap.cmp(&b_swap).then_with(|| {
            if a_swap {
                std::cmp::Ordering::Equal
            } else {
                compare_mount_points(order, &a.mount_point, &b.mount_point)
            }
        })
    });
    Ok(r)
}

/// Append an fstab line for every provisioned partition to `<root>/etc/fstab`.
pub fn update_fstab(
    ctx: &InstallationContext,
    disk_paths: &DiskPathIdMap,
    template: &ImageTemplate,
) -> Result<()> {
    let path = ctx.install_root().join(FSTAB);
    let r = (|| {
        let entries = fstab_entries(ctx, disk_paths, &template.disk.partitions)?;
        let root = ctx.open_root()?;
        root.create_dir_all("etc")?;
        let mut opts = OpenOptions::new();
        opts.append(true).create(true);
        let mut f = std::io::BufWriter::new(root.open_with(FSTAB, &opts)?);
        for e in entries {
            tracing::debug!("fstab: {e}");
            writeln!(f, "{e}")?;
        }
        f.flush()?;
        anyhow::Ok(())
    })();
    r.with_context(|| InstallError::FstabWriteFailure { path })
}
