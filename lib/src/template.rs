//! # The image template
//!
//! A validated image template is produced by an external loader; this module only
//! defines its shape and a structural (serde) deserializer for YAML documents.
//! The installation core treats the template as read-only, with the single exception
//! of the repository configurator appending to [`SystemConfig::additional_files`].

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// The toplevel template document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTemplate {
    /// Image naming
    pub image: ImageInfo,
    /// What we are building for
    pub target: TargetInfo,
    /// Disk layout; partitions are created externally
    #[serde(default)]
    pub disk: DiskConfig,
    /// Contents and configuration of the installed system
    pub system_config: SystemConfig,
}

/// Name and version of the produced image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image name
    pub name: String,
    /// Image version
    #[serde(default)]
    pub version: String,
}

/// The operating system, distribution and architecture being built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// e.g. `ubuntu`, `azl`, `emt`, `elxr`
    pub os: String,
    /// Distribution release, e.g. `24.04`, `azl3`
    pub dist: String,
    /// Architecture, e.g. `x86_64`
    pub arch: String,
    /// e.g. `raw`, `iso`
    #[serde(default)]
    pub image_type: String,
}

/// The package format used by a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgType {
    /// dpkg/apt based
    Deb,
    /// rpm based
    Rpm,
}

impl TargetInfo {
    /// Map the target OS to its package format.
    pub fn pkg_type(&self) -> Result<PkgType> {
        match self.os.as_str() {
            "ubuntu" | "debian" | "elxr" | "wind-river-elxr" => Ok(PkgType::Deb),
            "azl" | "azure-linux" | "emt" | "edge-microvisor-toolkit" => Ok(PkgType::Rpm),
            o => anyhow::bail!("Unsupported target OS: {o}"),
        }
    }

    /// Whether this target uses apt; unknown operating systems are not.
    pub fn is_debian_family(&self) -> bool {
        matches!(self.pkg_type(), Ok(PkgType::Deb))
    }

    /// Identifier used to namespace per-target build paths.
    pub fn provider_id(&self) -> String {
        format!("{}-{}-{}", self.os, self.dist, self.arch)
    }
}

/// Disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    /// Disk name
    #[serde(default)]
    pub name: String,
    /// Ordered partition list
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

/// One partition as declared in the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Identifier used to match the provisioned device
    pub id: String,
    /// Absolute mountpoint; empty (or `none`) for swap and unmounted partitions
    #[serde(default)]
    pub mount_point: String,
    /// e.g. `ext4`, `vfat`, `fat32`, `swap`
    pub fs_type: String,
    /// Comma separated mount options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_options: Option<String>,
}

impl Partition {
    /// The filesystem type as understood by `mount` and fstab.
    pub fn normalized_fs_type(&self) -> &str {
        match self.fs_type.as_str() {
            "fat" | "fat16" | "fat32" => "vfat",
            o => o,
        }
    }

    /// Whether this partition should be mounted into the install root.
    pub fn is_mountable(&self) -> bool {
        self.fs_type != "swap" && self.mount_point.starts_with('/')
    }
}

/// Configuration of the installed system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    /// Name of this system configuration; also names the install root
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Hostname; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Packages, in declared order
    #[serde(default)]
    pub packages: Vec<String>,
    /// Files copied into the image
    #[serde(default)]
    pub additional_files: Vec<AdditionalFileInfo>,
    /// Package repositories configured in the image
    #[serde(default)]
    pub package_repositories: Vec<PackageRepository>,
    /// Immutability and secure boot settings
    #[serde(default)]
    pub immutability: ImmutabilityConfig,
    /// Kernel settings
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Bootloader settings
    #[serde(default)]
    pub bootloader: BootloaderConfig,
    /// Network settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    /// Commands run in the chroot after everything else is installed
    #[serde(default)]
    pub configurations: Vec<ConfigurationCommand>,
}

impl SystemConfig {
    /// The hostname written into the image.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }
}

/// A file copied from the build host into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalFileInfo {
    /// Source path on the build host
    pub local: Utf8PathBuf,
    /// Absolute destination path inside the image
    #[serde(rename = "final")]
    pub final_path: Utf8PathBuf,
}

/// A package repository to configure in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRepository {
    /// Name for generated files; `codename` is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Suite/codename, e.g. `noble`
    pub codename: String,
    /// Base URL of the repository
    pub url: String,
    /// Location of the signing key; only its final path segment is used
    #[serde(default)]
    pub pkey: String,
    /// Pin priority; 500 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Components, e.g. `main contrib`; `main` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

/// Immutability and secure boot signing material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutabilityConfig {
    /// Whether the image is immutable (and hence signed)
    #[serde(default)]
    pub enabled: bool,
    /// Private key for the secure boot DB
    #[serde(rename = "secureBootDBKey", default)]
    pub secure_boot_db_key: Option<Utf8PathBuf>,
    /// PEM certificate for the secure boot DB
    #[serde(rename = "secureBootDBCrt", default)]
    pub secure_boot_db_crt: Option<Utf8PathBuf>,
    /// DER certificate exported for enrollment
    #[serde(rename = "secureBootDBCer", default)]
    pub secure_boot_db_cer: Option<Utf8PathBuf>,
}

/// Return the path if it is set to something non-empty.
pub(crate) fn nonempty_path(p: &Option<Utf8PathBuf>) -> Option<&Utf8Path> {
    p.as_deref().filter(|p| !p.as_str().is_empty())
}

/// Kernel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Expected kernel version; informational
    #[serde(default)]
    pub version: String,
    /// Extra kernel arguments
    #[serde(default)]
    pub cmdline: String,
}

/// Which bootloader to install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderProvider {
    /// systemd-boot
    #[default]
    SystemdBoot,
    /// GRUB
    Grub,
    /// Skip bootloader installation
    None,
}

/// Bootloader settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootloaderConfig {
    /// e.g. `efi`
    #[serde(default)]
    pub boot_type: String,
    /// The bootloader to install
    #[serde(default)]
    pub provider: BootloaderProvider,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Configure DHCP on matching interfaces
    #[serde(default)]
    pub dhcp: bool,
    /// Interface name glob
    #[serde(default = "default_interface_match", rename = "match")]
    pub interface_match: String,
}

fn default_interface_match() -> String {
    "en*".to_string()
}

/// A command to run in the chroot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationCommand {
    /// Shell command line
    pub cmd: String,
}

impl ImageTemplate {
    /// Parse a template from a YAML string.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("Parsing image template")
    }

    /// Parse a template from a YAML file.
    #[context("Loading template {path}")]
    pub fn from_yaml_path(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&buf)
    }
}
