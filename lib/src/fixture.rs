//! Test suite fixture.  Should only be used by this library.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};

use crate::error::InstallError;
use crate::install::config::BuildConfiguration;
use crate::install::InstallationContext;
use crate::mount::DiskPathIdMap;
use crate::task::{Executor, Task};
use crate::template::{ImageTemplate, Partition, SystemConfig, TargetInfo};

type Predicate = Box<dyn Fn(&Task) -> bool + Send + Sync>;
type Hook = Box<dyn Fn(&Task) -> Result<()> + Send + Sync>;

#[derive(Debug, Default)]
struct Recorded {
    tasks: Vec<Task>,
    mounted: Vec<String>,
}

/// An executor which runs nothing.  It records tasks, keeps a simulated
/// mount table, answers `blkid`, and can be told to fail.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    state: Mutex<Recorded>,
    fail_when: Option<Predicate>,
    hook: Option<Hook>,
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RecordingExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail every task matching `f`.
    pub(crate) fn fail_when(mut self, f: impl Fn(&Task) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Box::new(f));
        self
    }

    /// Run `f` for every task that succeeds; used to emulate side effects.
    pub(crate) fn on_task(mut self, f: impl Fn(&Task) -> Result<()> + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(f));
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    pub(crate) fn programs(&self) -> Vec<String> {
        self.tasks().iter().map(|t| t.program().to_string()).collect()
    }

    /// Currently mounted targets, in mount order.
    pub(crate) fn mounted(&self) -> Vec<String> {
        self.state().mounted.clone()
    }

    fn targets_of(&self, program: &str) -> Vec<String> {
        self.tasks()
            .iter()
            .filter(|t| t.program() == program)
            .filter_map(|t| t.arguments().last().cloned())
            .collect()
    }

    /// Targets of every `mount` invocation, in order.
    pub(crate) fn mount_history(&self) -> Vec<String> {
        self.targets_of("mount")
    }

    /// Targets of every `umount` invocation, in order.
    pub(crate) fn umount_history(&self) -> Vec<String> {
        self.targets_of("umount")
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, task: &Task) -> Result<String> {
        self.state().tasks.push(task.clone());
        if self.fail_when.as_ref().is_some_and(|f| f(task)) {
            return Err(InstallError::CommandFailure {
                description: task.description().to_string(),
                status: "exit status: 1".to_string(),
                output: "injected failure".to_string(),
            }
            .into());
        }
        let last = task.arguments().last().cloned().unwrap_or_default();
        let out = match task.program() {
            "mount" => {
                self.state().mounted.push(last);
                String::new()
            }
            "umount" => {
                let mut state = self.state();
                let idx = state
                    .mounted
                    .iter()
                    .position(|m| *m == last)
                    .ok_or_else(|| anyhow!("umount: {last}: not mounted"))?;
                state.mounted.remove(idx);
                String::new()
            }
            "blkid" => {
                let name = last.rsplit('/').next().unwrap_or_default();
                format!("uuid-{name}\n")
            }
            _ => String::new(),
        };
        if let Some(hook) = self.hook.as_ref() {
            hook(task)?;
        }
        Ok(out)
    }
}

pub(crate) fn partition(id: &str, mount_point: &str, fs_type: &str) -> Partition {
    Partition {
        id: id.to_string(),
        mount_point: mount_point.to_string(),
        fs_type: fs_type.to_string(),
        mount_options: None,
    }
}

/// The common EFI layout, declared deliberately out of order.
pub(crate) fn efi_partitions() -> Vec<Partition> {
    vec![
        partition("esp", "/boot/efi", "fat32"),
        partition("rootfs", "/", "ext4"),
        partition("bootfs", "/boot", "ext4"),
        partition("swap", "none", "swap"),
    ]
}

pub(crate) fn efi_disk_map() -> DiskPathIdMap {
    let mut m = DiskPathIdMap::default();
    for (id, dev) in [
        ("esp", "/dev/loop0p1"),
        ("bootfs", "/dev/loop0p2"),
        ("rootfs", "/dev/loop0p3"),
        ("swap", "/dev/loop0p4"),
    ] {
        m.insert(id, dev).unwrap();
    }
    m
}

pub(crate) fn template(os: &str) -> ImageTemplate {
    ImageTemplate {
        image: Default::default(),
        target: TargetInfo {
            os: os.to_string(),
            dist: "test".to_string(),
            arch: "x86_64".to_string(),
            image_type: "raw".to_string(),
        },
        disk: crate::template::DiskConfig {
            name: "disk0".to_string(),
            partitions: efi_partitions(),
        },
        system_config: SystemConfig {
            name: "edge".to_string(),
            packages: [
                "bash",
                "initramfs-tools",
                "filesystem",
                "systemd",
                "filesystem-extra",
                "initramfs-tools-core",
                "vim",
            ]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect(),
            ..Default::default()
        },
    }
}

/// A temporary install root, reachable both by path and as a directory fd,
/// with a separate work directory beside it.
#[derive(Debug)]
pub(crate) struct TempRoot {
    _tempdir: tempfile::TempDir,
    pub(crate) path: Utf8PathBuf,
    pub(crate) work_dir: Utf8PathBuf,
    pub(crate) dir: Dir,
}

impl TempRoot {
    pub(crate) fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let base = Utf8Path::from_path(tempdir.path())
            .ok_or_else(|| anyhow!("non-UTF8 tempdir"))?
            .to_owned();
        let path = base.join("root");
        let work_dir = base.join("work");
        std::fs::create_dir(&path)?;
        std::fs::create_dir(&work_dir)?;
        let dir = Dir::open_ambient_dir(&path, cap_std::ambient_authority())?;
        Ok(Self {
            _tempdir: tempdir,
            path,
            work_dir,
            dir,
        })
    }

    pub(crate) fn config(&self) -> BuildConfiguration {
        BuildConfiguration {
            work_dir: Some(self.work_dir.clone()),
            ..Default::default()
        }
    }

    /// A context installing into this root.
    pub(crate) fn context(&self, exec: Arc<RecordingExecutor>) -> InstallationContext {
        InstallationContext::new(self.path.clone(), exec, self.config(), "test")
    }
}
