//! # Package repository configuration
//!
//! For apt based targets, the repositories declared in the template are turned
//! into one sources list plus one pin preferences file per repository.  The
//! generated files are written to a staging directory and registered as
//! additional files of the template, so they are copied into the image along
//! with everything else.

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::InstallError;
use crate::template::{AdditionalFileInfo, ImageTemplate, PackageRepository};

/// Destination of the generated sources list inside the image
pub const SOURCES_LIST_PATH: &str = "/etc/apt/sources.list.d/package-repositories.list";
/// Directory of generated preferences files inside the image
pub const PREFERENCES_DIR: &str = "/etc/apt/preferences.d";
const KEYRINGS_DIR: &str = "/usr/share/keyrings";
const SOURCES_HEADER: &str = "# Package repositories generated from image template configuration";
const DEFAULT_PRIORITY: i32 = 500;
const DEFAULT_COMPONENT: &str = "main";

/// The keyring file name for a repository key location; only the final path
/// segment is used, and `.gpg` is appended unless already present.
fn keyring_name(pkey: &str) -> Result<String> {
    let base = pkey
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Missing signing key"))?;
    if base.ends_with(".gpg") {
        Ok(base.to_string())
    } else {
        Ok(format!("{base}.gpg"))
    }
}

/// The `deb` line for a repository.
fn sources_line(repo: &PackageRepository) -> Result<String> {
    let keyring = keyring_name(&repo.pkey)?;
    let component = repo
        .component
        .as_deref()
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_COMPONENT);
    Ok(format!(
        "deb [signed-by={KEYRINGS_DIR}/{keyring}] {} {} {component}",
        repo.url, repo.codename
    ))
}

/// Render the sources list for all repositories.
pub fn render_sources_list(repos: &[PackageRepository]) -> Result<String> {
    let mut r = String::from(SOURCES_HEADER);
    r.push('\n');
    for repo in repos {
        let line = sources_line(repo).with_context(|| format!("Repository {}", repo.codename))?;
        r.push_str(&line);
        r.push('\n');
    }
    Ok(r)
}

/// Render the pin preferences for a repository.
pub fn render_preferences(repo: &PackageRepository) -> Result<String> {
    let url = url::Url::parse(&repo.url).with_context(|| format!("Parsing {}", repo.url))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("No host in {}", repo.url))?;
    let priority = repo.priority.unwrap_or(DEFAULT_PRIORITY);
    let description = if priority == DEFAULT_PRIORITY {
        "Default"
    } else {
        "Install even if version is lower than installed"
    };
    Ok(format!(
        "# Priority {priority}: {description}\nPackage: *\nPin: origin {host}\nPin-Priority: {priority}\n"
    ))
}

/// The preferences file name for a repository.
fn preferences_name(repo: &PackageRepository) -> &str {
    repo.id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(&repo.codename)
}

/// Write `contents` to a new uniquely named file in `dir` that outlives this process.
fn write_staged(dir: &Utf8Path, prefix: &str, contents: &str) -> Result<Utf8PathBuf> {
    let mut tmp = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .with_context(|| format!("Creating temporary file in {dir}"))?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    let (_, path) = tmp.keep()?;
    Utf8PathBuf::try_from(path).map_err(Into::into)
}

/// Point the additional file for `dest` at `local`, adding it if not yet present.
fn set_additional_file(files: &mut Vec<AdditionalFileInfo>, local: Utf8PathBuf, dest: &str) {
    if let Some(existing) = files.iter_mut().find(|f| f.final_path == dest) {
        tracing::debug!("Replacing source of {dest}: {} -> {local}", existing.local);
        existing.local = local;
    } else {
        files.push(AdditionalFileInfo {
            local,
            final_path: dest.into(),
        });
    }
}

/// Generate apt configuration for the template's package repositories into
/// `staging_dir`, and register it in the template's additional files.  Targets
/// which do not use apt, and templates without repositories, are left unchanged.
#[context("Generating apt sources")]
pub fn generate_apt_sources(template: &mut ImageTemplate, staging_dir: &Utf8Path) -> Result<()> {
    if !template.target.is_debian_family() {
        tracing::debug!(
            "Not generating apt sources for target OS {}",
            template.target.os
        );
        return Ok(());
    }
    let repos = &template.system_config.package_repositories;
    if repos.is_empty() {
        return Ok(());
    }
    let count = repos.len();
    let r = (|| {
        let mut names = std::collections::HashSet::new();
        let clash = repos
            .iter()
            .map(preferences_name)
            .find(|n| !names.insert(*n));
        if let Some(name) = clash {
            anyhow::bail!("Multiple repositories share the preferences name {name}");
        }
        std::fs::create_dir_all(staging_dir)
            .with_context(|| format!("Creating {staging_dir}"))?;
        let sources = render_sources_list(repos)?;
        let sources_local = write_staged(staging_dir, "package-repositories-", &sources)?;
        let mut generated = vec![(sources_local, SOURCES_LIST_PATH.to_string())];
        for repo in repos {
            let name = preferences_name(repo);
            let prefs = render_preferences(repo)
                .with_context(|| format!("Repository {}", repo.codename))?;
            let local = write_staged(staging_dir, &format!("preferences-{name}-"), &prefs)?;
            generated.push((local, format!("{PREFERENCES_DIR}/{name}")));
        }
        anyhow::Ok(generated)
    })();
    let generated = r.context(InstallError::RepositoryGenerationFailure)?;
    let files = &mut template.system_config.additional_files;
    for (local, dest) in generated {
        set_additional_file(files, local, &dest);
    }
    tracing::info!("Generated configuration for {count} package repositories");
    Ok(())
}
