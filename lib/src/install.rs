//! # Installing a system configuration into a chroot
//!
//! The installation runs as a fixed sequence of stages against an install root
//! whose partitions have already been provisioned.  Once the partitions are
//! mounted, they are unmounted again whatever the outcome.

pub mod config;
pub(crate) mod osconfig;

use std::fmt::Display;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;

use self::config::BuildConfiguration;
use crate::error::InstallError;
use crate::mount::{self, DiskPathIdMap};
use crate::task::{Executor, Task};
use crate::template::ImageTemplate;

/// Directories every root needs before packages are installed
const ROOT_SKELETON: &[&str] = &["etc", "var/lib", "boot"];

/// Everything a stage needs to know about the installation in progress.
#[derive(Debug)]
pub struct InstallationContext {
    install_root: Utf8PathBuf,
    executor: Arc<dyn Executor>,
    config: BuildConfiguration,
    provider: String,
}

impl InstallationContext {
    /// Create a context for an explicit install root.
    pub fn new(
        install_root: Utf8PathBuf,
        executor: Arc<dyn Executor>,
        config: BuildConfiguration,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            install_root,
            executor,
            config,
            provider: provider.into(),
        }
    }

    /// Create a context for a template; the install root is
    /// `<chroot-build-dir>/<system config name>`.
    pub fn for_template(
        template: &ImageTemplate,
        config: BuildConfiguration,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let provider = template.target.provider_id();
        let install_root = config
            .chroot_build_dir(&provider)
            .join(&template.system_config.name);
        Self::new(install_root, executor, config, provider)
    }

    /// The install root on the build host.
    pub fn install_root(&self) -> &Utf8Path {
        &self.install_root
    }

    /// The executor running all commands.
    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// The build configuration.
    pub fn config(&self) -> &BuildConfiguration {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn config_mut(&mut self) -> &mut BuildConfiguration {
        &mut self.config
    }

    /// The provider identifier namespacing work paths.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Output directory for artifacts of a system configuration.
    pub fn imagebuild_dir(&self, system_config_name: &str) -> Utf8PathBuf {
        self.config
            .imagebuild_dir(&self.provider, system_config_name)
    }

    /// Directory holding generated files before they are copied into the root.
    pub fn staging_dir(&self, system_config_name: &str) -> Utf8PathBuf {
        self.config
            .work_dir()
            .join(&self.provider)
            .join("staging")
            .join(system_config_name)
    }

    /// Open the install root.  Stages open it afresh so that they see what is
    /// mounted there now.
    pub(crate) fn open_root(&self) -> Result<Dir> {
        Dir::open_ambient_dir(&self.install_root, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.install_root))
    }
}

/// The stages of an installation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    /// Nothing done yet
    Init,
    /// The install root exists
    RootInitialized,
    /// Partitions and virtual filesystems are mounted
    Mounted,
    /// The root skeleton exists
    PreInstalled,
    /// All packages are installed
    PackagesInstalled,
    /// Repositories, fstab, hostname, network and additional files are configured
    ConfigUpdated,
    /// The bootloader is installed
    BootInstalled,
    /// The kernel command line is recorded
    SecurityConfigured,
    /// The unified kernel image is built
    UkiBuilt,
    /// Boot artifacts are signed, if configured
    Signed,
    /// Configuration commands have run
    PostInstalled,
    /// Everything is unmounted again
    Unmounted,
}

impl Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::RootInitialized => "root-initialized",
            Self::Mounted => "mounted",
            Self::PreInstalled => "pre-installed",
            Self::PackagesInstalled => "packages-installed",
            Self::ConfigUpdated => "config-updated",
            Self::BootInstalled => "boot-installed",
            Self::SecurityConfigured => "security-configured",
            Self::UkiBuilt => "uki-built",
            Self::Signed => "signed",
            Self::PostInstalled => "post-installed",
            Self::Unmounted => "unmounted",
        };
        f.write_str(s)
    }
}

/// One run of the installation pipeline.
#[derive(Debug)]
pub struct Installation<'a> {
    ctx: &'a InstallationContext,
    state: InstallState,
    failed_stage: Option<InstallState>,
}

impl<'a> Installation<'a> {
    /// Prepare an installation using `ctx`.
    pub fn new(ctx: &'a InstallationContext) -> Self {
        Self {
            ctx,
            state: InstallState::Init,
            failed_stage: None,
        }
    }

    /// The last state reached.
    pub fn state(&self) -> InstallState {
        self.state
    }

    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<InstallState> {
        self.failed_stage
    }

    fn transition(&mut self, state: InstallState) {
        tracing::debug!("Installation state: {} -> {state}", self.state);
        self.state = state;
    }

    /// Run `f` to reach `next`; on failure, remember which stage failed.
    fn stage<T>(&mut self, next: InstallState, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match f() {
            Ok(v) => {
                self.transition(next);
                Ok(v)
            }
            Err(e) => {
                self.failed_stage = Some(next);
                Err(e)
            }
        }
    }

    /// Run every stage.  After a successful mount, everything is unmounted again
    /// before returning; an unmount failure is only returned when nothing else failed.
    pub fn run(&mut self, template: &mut ImageTemplate, disk_paths: &DiskPathIdMap) -> Result<()> {
        let ctx = self.ctx;
        let root = ctx.install_root();
        self.stage(InstallState::RootInitialized, || {
            if !root.try_exists()? {
                return Err(InstallError::InstallRootMissing(root.to_owned()).into());
            }
            Ok(())
        })?;

        let mut mounted = self.stage(InstallState::Mounted, || {
            mount::mount_all(
                ctx.executor.clone(),
                root,
                disk_paths,
                &template.disk.partitions,
                ctx.config.mount_order(),
            )
        })?;

        let r = self.run_mounted(template, disk_paths);
        let teardown = mounted.teardown();
        match (r, teardown) {
            (Ok(()), Ok(())) => {
                self.transition(InstallState::Unmounted);
                tracing::info!("Installation of {} complete", template.system_config.name);
                Ok(())
            }
            (Err(e), Ok(())) => {
                self.transition(InstallState::Unmounted);
                Err(e)
            }
            (Err(e), Err(te)) => {
                tracing::warn!("Unmounting after failure: {te:#}");
                Err(e)
            }
            (Ok(()), Err(te)) => {
                self.failed_stage = Some(InstallState::Unmounted);
                Err(te)
            }
        }
    }

    fn run_mounted(&mut self, template: &mut ImageTemplate, disk_paths: &DiskPathIdMap) -> Result<()> {
        let ctx = self.ctx;
        self.stage(InstallState::PreInstalled, || pre_install(ctx))?;
        self.stage(InstallState::PackagesInstalled, || {
            crate::packages::install_packages(ctx, template)
        })?;
        self.stage(InstallState::ConfigUpdated, || {
            update_config(ctx, template, disk_paths)
        })?;
        self.stage(InstallState::BootInstalled, || {
            crate::bootloader::install_bootloader(ctx, template)
        })?;
        self.stage(InstallState::SecurityConfigured, || {
            crate::uki::write_kernel_cmdline(ctx, template)
        })?;
        self.stage(InstallState::UkiBuilt, || {
            crate::uki::build_uki(ctx, template).map(drop)
        })?;
        self.stage(InstallState::Signed, || {
            crate::secureboot::sign_image(ctx, template)
        })?;
        self.stage(InstallState::PostInstalled, || post_install(ctx, template))?;
        Ok(())
    }
}

#[context("Preparing root")]
fn pre_install(ctx: &InstallationContext) -> Result<()> {
    let root = ctx.open_root()?;
    for d in ROOT_SKELETON {
        root.create_dir_all(d)
            .with_context(|| format!("Creating {d}"))?;
    }
    Ok(())
}

#[context("Updating configuration")]
fn update_config(
    ctx: &InstallationContext,
    template: &mut ImageTemplate,
    disk_paths: &DiskPathIdMap,
) -> Result<()> {
    let staging = ctx.staging_dir(&template.system_config.name);
    crate::repos::generate_apt_sources(template, &staging)?;
    crate::fstab::update_fstab(ctx, disk_paths, template)?;
    let root = ctx.open_root()?;
    let sc = &template.system_config;
    osconfig::write_hostname(&root, sc.hostname())?;
    if let Some(network) = sc.network.as_ref() {
        osconfig::write_network(&root, network)?;
    }
    osconfig::copy_additional_files(&root, &sc.additional_files)?;
    Ok(())
}

#[context("Running configuration commands")]
fn post_install(ctx: &InstallationContext, template: &ImageTemplate) -> Result<()> {
    for c in template.system_config.configurations.iter() {
        Task::new(format!("Running {}", c.cmd), "sh")
            .args(["-c", c.cmd.as_str()])
            .chroot(ctx.install_root())
            .run(ctx.executor())?;
    }
    Ok(())
}

/// Install `template` into the root described by `ctx`, returning the final state.
pub fn install(
    ctx: &InstallationContext,
    template: &mut ImageTemplate,
    disk_paths: &DiskPathIdMap,
) -> Result<InstallState> {
    let mut installation = Installation::new(ctx);
    match installation.run(template, disk_paths) {
        Ok(()) => Ok(installation.state()),
        Err(e) => {
            if let Some(stage) = installation.failed_stage() {
                tracing::debug!("Failed to reach {stage}");
            }
            Err(e)
        }
    }
}
