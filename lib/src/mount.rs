//! # Mounting the install root
//!
//! Partitions are provisioned externally; we receive a mapping from partition ID
//! to block device path, pair it with the template's partition list, and mount
//! everything below the install root parents-first.  Teardown is the exact reverse.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::error::InstallError;
use crate::task::{Executor, Task};
use crate::template::Partition;

/// Where the EFI system partition is mounted
pub(crate) const ESP_MOUNTPOINT: &str = "/boot/efi";
/// Mount options for a FAT ESP; keeps boot material private to root
const ESP_OPTIONS: &str = "umask=0077";
/// Virtual filesystems mounted inside the chroot, as (fstype, relative target).
const VIRTUAL_MOUNTS: &[(&str, &str)] = &[("sysfs", "sys")];

/// How mountpoints are ordered for mounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountOrder {
    /// Order by number of path segments, then by string value.
    #[default]
    Depth,
    /// Order by string value only.  Parents still sort before their children,
    /// but children may be mounted before unrelated shallower siblings.
    Lexicographic,
}

/// One entry of a [`DiskPathIdMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPathEntry {
    /// Partition ID as declared in the template
    pub id: String,
    /// Provisioned block device
    pub path: Utf8PathBuf,
}

/// Partition ID to block device path, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DiskPathEntry>", into = "Vec<DiskPathEntry>")]
pub struct DiskPathIdMap(Vec<DiskPathEntry>);

impl DiskPathIdMap {
    /// Add a mapping; partition IDs must be unique.
    pub fn insert(&mut self, id: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Result<()> {
        let id = id.into();
        if self.get(&id).is_some() {
            anyhow::bail!("Duplicate partition ID {id}");
        }
        self.0.push(DiskPathEntry {
            id,
            path: path.into(),
        });
        Ok(())
    }

    /// Look up the device for a partition.
    pub fn get(&self, id: &str) -> Option<&Utf8Path> {
        self.0
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.path.as_path())
    }

    /// Iterate over (partition ID, device) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Utf8Path)> {
        self.0.iter().map(|e| (e.id.as_str(), e.path.as_path()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Load a JSON array of `{"id": ..., "path": ...}` objects.
    #[context("Loading partition map {path}")]
    pub fn from_json_path(path: &Utf8Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(f)).map_err(Into::into)
    }
}

impl TryFrom<Vec<DiskPathEntry>> for DiskPathIdMap {
    type Error = anyhow::Error;

    fn try_from(value: Vec<DiskPathEntry>) -> Result<Self> {
        let mut r = Self::default();
        for e in value {
            r.insert(e.id, e.path)?;
        }
        Ok(r)
    }
}

impl From<DiskPathIdMap> for Vec<DiskPathEntry> {
    fn from(value: DiskPathIdMap) -> Self {
        value.0
    }
}

/// A partition resolved to its device and location under the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Partition ID
    pub partition_id: String,
    /// Block device
    pub device_path: Utf8PathBuf,
    /// Mountpoint as seen from inside the image, e.g. `/boot`
    pub mount_point: String,
    /// Mountpoint on the build host
    pub absolute_mount_point: Utf8PathBuf,
    /// Arguments to `mount` preceding the device
    pub mount_flags: Vec<String>,
}

/// Join an absolute in-image path onto the install root.
pub(crate) fn path_in_root(install_root: &Utf8Path, p: &str) -> Utf8PathBuf {
    let rel = p.trim_start_matches('/');
    if rel.is_empty() {
        install_root.to_owned()
    } else {
        install_root.join(rel)
    }
}

/// Compute the `mount` flags for a partition.
pub(crate) fn mount_flags(part: &Partition) -> Vec<String> {
    if part.mount_point == ESP_MOUNTPOINT && part.normalized_fs_type() == "vfat" {
        ["-t", "vfat", "-o", ESP_OPTIONS]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    } else {
        vec!["-t".to_string(), part.normalized_fs_type().to_string()]
    }
}

fn depth(p: &str) -> usize {
    p.split('/').filter(|s| !s.is_empty()).count()
}

/// Compare two mountpoints; parents always compare less than their children.
pub(crate) fn compare_mount_points(order: MountOrder, a: &str, b: &str) -> std::cmp::Ordering {
    match order {
        MountOrder::Depth => depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)),
        MountOrder::Lexicographic => a.cmp(b),
    }
}

/// Order mountpoints so that parents precede children.
pub(crate) fn sort_mount_points(mounts: &mut [MountPointInfo], order: MountOrder) {
    mounts.sort_by(|a, b| {
        compare_mount_points(
            order,
            a.absolute_mount_point.as_str(),
            b.absolute_mount_point.as_str(),
        )
    });
}

/// Pair every provisioned device with its template partition, skipping swap
/// and partitions without a mountpoint, and return them in mount order.
pub fn resolve_mount_points(
    install_root: &Utf8Path,
    disk_paths: &DiskPathIdMap,
    partitions: &[Partition],
    order: MountOrder,
) -> Result<Vec<MountPointInfo>> {
    let mut r = Vec::new();
    for (id, device) in disk_paths.iter() {
        let part = partitions
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("No partition with ID {id} in template"))
            .with_context(|| InstallError::MountFailure {
                target: id.to_string(),
            })?;
        if !part.is_mountable() {
            tracing::debug!("Not mounting partition {id} ({})", part.fs_type);
            continue;
        }
        r.push(MountPointInfo {
            partition_id: id.to_string(),
            device_path: device.to_owned(),
            mount_point: part.mount_point.clone(),
            absolute_mount_point: path_in_root(install_root, &part.mount_point),
            mount_flags: mount_flags(part),
        });
    }
    sort_mount_points(&mut r, order);
    Ok(r)
}

fn mkdir_p(executor: &dyn Executor, path: &Utf8Path) -> Result<()> {
    Task::new(format!("Creating {path}"), "mkdir")
        .quiet()
        .privileged()
        .args(["-p", path.as_str()])
        .run(executor)
        .map(drop)
}

fn mount_one(executor: &dyn Executor, m: &MountPointInfo) -> Result<()> {
    let target = m.absolute_mount_point.as_str();
    mkdir_p(executor, &m.absolute_mount_point).with_context(|| InstallError::MountFailure {
        target: target.to_string(),
    })?;
    Task::new(format!("Mounting {}", m.mount_point), "mount")
        .privileged()
        .args(&m.mount_flags)
        .args([m.device_path.as_str(), target])
        .run(executor)
        .map(drop)
        .with_context(|| InstallError::MountFailure {
            target: target.to_string(),
        })
}

fn mount_virtual(executor: &dyn Executor, fstype: &str, target: &Utf8Path) -> Result<()> {
    mkdir_p(executor, target).with_context(|| InstallError::MountFailure {
        target: target.to_string(),
    })?;
    Task::new(format!("Mounting {fstype}"), "mount")
        .quiet()
        .privileged()
        .args(["-t", fstype, fstype, target.as_str()])
        .run(executor)
        .map(drop)
        .with_context(|| InstallError::MountFailure {
            target: target.to_string(),
        })
}

fn umount(executor: &dyn Executor, target: &Utf8Path) -> Result<()> {
    Task::new(format!("Unmounting {target}"), "umount")
        .quiet()
        .privileged()
        .args([target.as_str()])
        .run(executor)
        .map(drop)
        .with_context(|| InstallError::UnmountFailure {
            target: target.to_string(),
        })
}

/// Unmount every target in order, attempting each exactly once.  All failures
/// are logged; the first is returned.
fn umount_each<'a>(
    executor: &dyn Executor,
    targets: impl IntoIterator<Item = &'a Utf8Path>,
) -> Result<()> {
    let mut first_err = None;
    for target in targets {
        if let Err(e) = umount(executor, target) {
            tracing::warn!("{e:#}");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn virtual_targets(install_root: &Utf8Path) -> impl Iterator<Item = (&'static str, Utf8PathBuf)> + '_ {
    VIRTUAL_MOUNTS
        .iter()
        .map(move |(fstype, rel)| (*fstype, install_root.join(rel)))
}

/// Undo a complete [`mount_all`]: virtual filesystems first, then every
/// mountpoint from last-mounted to first-mounted.
pub fn unmount_all(
    executor: &dyn Executor,
    install_root: &Utf8Path,
    mounts: &[MountPointInfo],
) -> Result<()> {
    let virt = virtual_targets(install_root)
        .map(|(_, p)| p)
        .collect::<Vec<_>>();
    let targets = virt
        .iter()
        .rev()
        .map(|p| p.as_path())
        .chain(mounts.iter().rev().map(|m| m.absolute_mount_point.as_path()));
    umount_each(executor, targets)
}

/// The mounted install root.  Dropping it without calling
/// [`MountedRoot::teardown`] unmounts everything and logs failures.
#[derive(Debug)]
pub struct MountedRoot {
    executor: Arc<dyn Executor>,
    install_root: Utf8PathBuf,
    mounts: Vec<MountPointInfo>,
    virtual_mounts: Vec<Utf8PathBuf>,
    torn_down: bool,
}

impl MountedRoot {
    /// Mounted partitions, in mount order.
    pub fn mount_points(&self) -> &[MountPointInfo] {
        &self.mounts
    }

    /// Unmount everything we mounted, in exact reverse order.  Calling this
    /// more than once is a no-op.
    pub fn teardown(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.torn_down, true) {
            return Ok(());
        }
        tracing::debug!("Unmounting {}", self.install_root);
        let targets = self
            .virtual_mounts
            .iter()
            .rev()
            .chain(self.mounts.iter().rev().map(|m| &m.absolute_mount_point))
            .map(|p| p.as_path());
        umount_each(self.executor.as_ref(), targets)
    }
}

impl Drop for MountedRoot {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("Failed to tear down {}: {e:#}", self.install_root);
        }
    }
}

/// Mount all provisioned partitions below `install_root`, then the virtual
/// filesystems needed inside the chroot.  The first failure aborts; anything
/// already mounted is unmounted again before the error is returned.
#[context("Mounting partitions into {install_root}")]
pub fn mount_all(
    executor: Arc<dyn Executor>,
    install_root: &Utf8Path,
    disk_paths: &DiskPathIdMap,
    partitions: &[Partition],
    order: MountOrder,
) -> Result<MountedRoot> {
    let mounts = resolve_mount_points(install_root, disk_paths, partitions, order)?;
    let mut root = MountedRoot {
        executor: executor.clone(),
        install_root: install_root.to_owned(),
        mounts: Vec::with_capacity(mounts.len()),
        virtual_mounts: Vec::new(),
        torn_down: false,
    };
    let r = (|| {
        for m in mounts {
            mount_one(executor.as_ref(), &m)?;
            root.mounts.push(m);
        }
        for (fstype, target) in virtual_targets(install_root) {
            mount_virtual(executor.as_ref(), fstype, &target)?;
            root.virtual_mounts.push(target);
        }
        anyhow::Ok(())
    })();
    match r {
        Ok(()) => Ok(root),
        Err(e) => {
            if let Err(te) = root.teardown() {
                tracing::warn!("Cleaning up partial mounts: {te:#}");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, RecordingExecutor};

    const ROOT: &str = "/build/chroot/edge";

    fn points(order: MountOrder, parts: &[Partition]) -> Vec<String> {
        resolve_mount_points(
            Utf8Path::new(ROOT),
            &fixture::efi_disk_map(),
            parts,
            order,
        )
        .unwrap()
        .into_iter()
        .map(|m| m.mount_point)
        .collect()
    }

    #[test]
    fn test_mount_order_common_layout() {
        let mut parts = fixture::efi_partitions();
        for order in [MountOrder::Depth, MountOrder::Lexicographic] {
            for _ in 0..parts.len() {
                parts.rotate_left(1);
                assert_eq!(points(order, &parts), ["/", "/boot", "/boot/efi"]);
            }
        }
    }

    #[test]
    fn test_depth_vs_lexicographic() {
        let parts = vec![
            fixture::partition("rootfs", "/", "ext4"),
            fixture::partition("var", "/var", "ext4"),
            fixture::partition("srvdata", "/srv/data", "ext4"),
            fixture::partition("srv", "/srv", "ext4"),
        ];
        let mut map = DiskPathIdMap::default();
        for (i, p) in parts.iter().enumerate() {
            map.insert(p.id.clone(), format!("/dev/vdb{i}")).unwrap();
        }
        let order = |o| {
            resolve_mount_points(Utf8Path::new(ROOT), &map, &parts, o)
                .unwrap()
                .into_iter()
                .map(|m| m.mount_point)
                .collect::<Vec<_>>()
        };
        assert_eq!(order(MountOrder::Depth), ["/", "/srv", "/var", "/srv/data"]);
        assert_eq!(
            order(MountOrder::Lexicographic),
            ["/", "/srv", "/srv/data", "/var"]
        );
    }

    #[test]
    fn test_flags() {
        let esp = fixture::partition("esp", "/boot/efi", "fat32");
        assert_eq!(mount_flags(&esp), ["-t", "vfat", "-o", "umask=0077"]);
        let data = fixture::partition("data", "/data", "fat16");
        assert_eq!(mount_flags(&data), ["-t", "vfat"]);
        let data = fixture::partition("data", "/data", "fat");
        assert_eq!(mount_flags(&data), ["-t", "vfat"]);
        let esp = fixture::partition("esp", "/boot/efi", "fat");
        assert_eq!(mount_flags(&esp), ["-t", "vfat", "-o", "umask=0077"]);
        let root = fixture::partition("root", "/", "ext4");
        assert_eq!(mount_flags(&root), ["-t", "ext4"]);
    }

    #[test]
    fn test_unknown_partition() {
        let mut map = fixture::efi_disk_map();
        map.insert("bogus", "/dev/sdz1").unwrap();
        let e = resolve_mount_points(
            Utf8Path::new(ROOT),
            &map,
            &fixture::efi_partitions(),
            MountOrder::Depth,
        )
        .unwrap_err();
        assert!(matches!(
            e.downcast_ref::<InstallError>(),
            Some(InstallError::MountFailure { target }) if target == "bogus"
        ));
    }

    #[test]
    fn test_duplicate_ids() {
        let mut map = DiskPathIdMap::default();
        map.insert("a", "/dev/sda1").unwrap();
        assert!(map.insert("a", "/dev/sda2").is_err());
        let r: Result<DiskPathIdMap, _> =
            serde_json::from_str(r#"[{"id":"a","path":"/dev/sda1"},{"id":"a","path":"/dev/sda2"}]"#);
        assert!(r.is_err());
        let r: DiskPathIdMap =
            serde_json::from_str(r#"[{"id":"b","path":"/dev/sda2"},{"id":"a","path":"/dev/sda1"}]"#)
                .unwrap();
        assert_eq!(r.iter().map(|(id, _)| id).collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(r.get("a").map(|p| p.as_str()), Some("/dev/sda1"));
    }

    #[test]
    fn test_mount_and_teardown_order() {
        let exec = Arc::new(RecordingExecutor::new());
        let root = Utf8Path::new(ROOT);
        let mut mounted = mount_all(
            exec.clone(),
            root,
            &fixture::efi_disk_map(),
            &fixture::efi_partitions(),
            MountOrder::Depth,
        )
        .unwrap();
        let expected = [ROOT, "/build/chroot/edge/boot", "/build/chroot/edge/boot/efi"];
        assert_eq!(mounted.mount_points().len(), 3);
        assert_eq!(
            exec.mount_history(),
            [&expected[..], &["/build/chroot/edge/sys"]].concat()
        );
        let esp = exec
            .tasks()
            .into_iter()
            .find(|t| t.program() == "mount" && t.arguments().contains(&"/dev/loop0p1".to_string()))
            .unwrap();
        assert_eq!(
            esp.arguments(),
            ["-t", "vfat", "-o", "umask=0077", "/dev/loop0p1", "/build/chroot/edge/boot/efi"]
        );
        mounted.teardown().unwrap();
        assert!(exec.mounted().is_empty());
        let mut reversed = expected.to_vec();
        reversed.reverse();
        assert_eq!(
            exec.umount_history(),
            [&["/build/chroot/edge/sys"][..], &reversed[..]].concat()
        );
        // Second teardown does nothing
        mounted.teardown().unwrap();
        assert_eq!(exec.umount_history().len(), 4);
    }

    #[test]
    fn test_mount_failure_cleans_up() {
        let exec = Arc::new(RecordingExecutor::new().fail_when(|t| {
            t.program() == "mount" && t.arguments().last().is_some_and(|a| a.ends_with("/boot/efi"))
        }));
        let e = mount_all(
            exec.clone(),
            Utf8Path::new(ROOT),
            &fixture::efi_disk_map(),
            &fixture::efi_partitions(),
            MountOrder::Depth,
        )
        .unwrap_err();
        match e.downcast_ref::<InstallError>() {
            Some(InstallError::MountFailure { target }) => {
                assert_eq!(target, "/build/chroot/edge/boot/efi")
            }
            o => panic!("unexpected {o:?}"),
        }
        assert!(exec.mounted().is_empty());
        // sysfs was never mounted so it is not unmounted either
        assert_eq!(
            exec.umount_history(),
            ["/build/chroot/edge/boot", "/build/chroot/edge"]
        );
    }

    #[test]
    fn test_unmount_attempts_all() {
        let exec = Arc::new(
            RecordingExecutor::new()
                .fail_when(|t| t.program() == "umount" && t.arguments()[0].ends_with("/boot")),
        );
        let mut mounted = mount_all(
            exec.clone(),
            Utf8Path::new(ROOT),
            &fixture::efi_disk_map(),
            &fixture::efi_partitions(),
            MountOrder::Depth,
        )
        .unwrap();
        let e = mounted.teardown().unwrap_err();
        assert!(matches!(
            e.downcast_ref::<InstallError>(),
            Some(InstallError::UnmountFailure { .. })
        ));
        // Every target was attempted exactly once
        assert_eq!(exec.umount_history().len(), 4);
        assert_eq!(exec.mounted(), ["/build/chroot/edge/boot"]);
    }

    #[test]
    fn test_unmount_all_reverses_mount_all() {
        let exec = Arc::new(RecordingExecutor::new());
        let root = Utf8Path::new(ROOT);
        let mut mounted = mount_all(
            exec.clone(),
            root,
            &fixture::efi_disk_map(),
            &fixture::efi_partitions(),
            MountOrder::Depth,
        )
        .unwrap();
        let points = mounted.mount_points().to_vec();
        unmount_all(exec.as_ref(), root, &points).unwrap();
        assert!(exec.mounted().is_empty());
        // Drop must not unmount a second time; mark it torn down.
        mounted.torn_down = true;
    }

    #[test]
    fn test_drop_tears_down() {
        let exec = Arc::new(RecordingExecutor::new());
        {
            let _mounted = mount_all(
                exec.clone(),
                Utf8Path::new(ROOT),
                &fixture::efi_disk_map(),
                &fixture::efi_partitions(),
                MountOrder::Depth,
            )
            .unwrap();
            assert_eq!(exec.mounted().len(), 4);
        }
        assert!(exec.mounted().is_empty());
    }
}
