//! # Build configuration
//!
//! This module handles the TOML configuration files for image builds, e.g.
//! `/etc/imgcomposer/05-workdir.toml`.  Fragments are merged in the usual
//! systemd precedence order; an explicitly provided file is merged last.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::mount::MountOrder;

/// Default root for per-build state
const DEFAULT_WORK_DIR: &str = "/var/tmp/imgcomposer";

/// The toplevel config entry for build configs stored
/// in imgcomposer/ (e.g. /etc/imgcomposer/05-custom.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct BuildConfigurationToplevel {
    pub(crate) build: Option<BuildConfiguration>,
}

/// The serialized [build] section
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename = "build", rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildConfiguration {
    /// Root directory for per-build state
    pub work_dir: Option<Utf8PathBuf>,
    /// Parent directory of install roots
    pub chroot_build_dir: Option<Utf8PathBuf>,
    /// How mountpoints are ordered
    pub mount_order: Option<MountOrder>,
    /// Extra kernel arguments appended to the UKI command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_cmdline: Option<Vec<String>>,
}

impl BuildConfiguration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.work_dir, other.work_dir);
        mergeopt(&mut self.chroot_build_dir, other.chroot_build_dir);
        mergeopt(&mut self.mount_order, other.mount_order);
        if let Some(other_kargs) = other.kernel_cmdline {
            self.kernel_cmdline
                .get_or_insert_with(Default::default)
                .extend(other_kargs)
        }
    }

    /// The work directory root.
    pub fn work_dir(&self) -> &Utf8Path {
        self.work_dir
            .as_deref()
            .unwrap_or(Utf8Path::new(DEFAULT_WORK_DIR))
    }

    /// Directory holding install roots for the given provider.
    pub fn chroot_build_dir(&self, provider: &str) -> Utf8PathBuf {
        self.chroot_build_dir
            .clone()
            .unwrap_or_else(|| self.work_dir().join(provider).join("chrootbuild"))
    }

    /// Output directory for artifacts of one system configuration.
    pub fn imagebuild_dir(&self, provider: &str, system_config_name: &str) -> Utf8PathBuf {
        self.work_dir()
            .join(provider)
            .join("imagebuild")
            .join(system_config_name)
    }

    /// The configured mount ordering.
    pub fn mount_order(&self) -> MountOrder {
        self.mount_order.unwrap_or_default()
    }
}

fn parse_fragment(buf: &str, path: &Utf8Path) -> Result<Option<BuildConfiguration>> {
    let mut unused = std::collections::HashSet::new();
    let de = toml::Deserializer::new(buf);
    let c: BuildConfigurationToplevel = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {path}"))?;
    for key in unused {
        tracing::warn!("{path}: Unknown key {key}");
    }
    Ok(c.build)
}

#[context("Loading configuration")]
/// Load the build configuration, merging all found configuration files and
/// finally `explicit`, if provided.  No configuration at all yields the defaults.
pub fn load_config(explicit: Option<&Utf8Path>) -> Result<BuildConfiguration> {
    const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
    let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, "imgcomposer", &["toml"], true);
    let mut config = BuildConfiguration::default();
    let explicit = explicit.map(|p| p.as_std_path().to_owned());
    for path in fragments.into_values().chain(explicit) {
        let path = Utf8PathBuf::try_from(path)?;
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        if let Some(c) = parse_fragment(&buf, &path)? {
            tracing::debug!("Merging build config: {c:?}");
            config.merge(c);
        }
    }
    Ok(config)
}
