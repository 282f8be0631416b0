//! # Image composer CLI
//!
//! Command line tool to install a system configuration into pre-provisioned partitions.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::install::config::load_config;
use crate::install::InstallationContext;
use crate::mount::DiskPathIdMap;
use crate::task::HostExecutor;
use crate::template::ImageTemplate;

/// Install a system configuration into provisioned partitions
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct InstallOpts {
    /// Path to the image template (YAML)
    #[clap(long)]
    pub(crate) template: Utf8PathBuf,

    /// Path to the partition map: a JSON array of `{"id": ..., "path": ...}` objects
    /// pairing template partition IDs with provisioned block devices.
    #[clap(long)]
    pub(crate) partitions: Utf8PathBuf,

    /// Additional build configuration (TOML), merged after all configuration fragments
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Generate package repository configuration only
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct GenerateReposOpts {
    /// Path to the image template (YAML)
    #[clap(long)]
    pub(crate) template: Utf8PathBuf,

    /// Directory for the generated files
    #[clap(long)]
    pub(crate) output_dir: Utf8PathBuf,
}

/// Install operating system images into chroot environments.
///
/// Partitions are expected to be created externally; this tool mounts them,
/// installs packages, configures the system, builds and optionally signs a
/// unified kernel image, and unmounts everything again.
#[derive(Debug, Parser)]
#[clap(name = "imgcomposer")]
#[clap(rename_all = "kebab-case", version)]
pub(crate) enum Opt {
    /// Install the template's system configuration into its install root.
    Install(InstallOpts),
    /// Generate apt sources and preferences for the template's package
    /// repositories, and print the resulting additional files as JSON.
    GenerateRepos(GenerateReposOpts),
}

/// Implementation of the `install` CLI command.
async fn install(opts: InstallOpts) -> Result<()> {
    let mut template = ImageTemplate::from_yaml_path(&opts.template)?;
    let disk_paths = DiskPathIdMap::from_json_path(&opts.partitions)?;
    let config = load_config(opts.config.as_deref())?;
    let ctx = InstallationContext::for_template(&template, config, Arc::new(HostExecutor));
    let root = ctx.install_root();
    std::fs::create_dir_all(root).with_context(|| format!("Creating {root}"))?;
    tracing::info!("Installing {} into {root}", template.system_config.name);

    // This is all blocking stuff
    let state = tokio::task::spawn_blocking(move || {
        crate::install::install(&ctx, &mut template, &disk_paths)
    })
    .await??;
    tracing::debug!("Final state: {state}");
    println!("Installation complete!");
    Ok(())
}

/// Implementation of the `generate-repos` CLI command.
fn generate_repos(opts: GenerateReposOpts) -> Result<()> {
    let mut template = ImageTemplate::from_yaml_path(&opts.template)?;
    crate::repos::generate_apt_sources(&mut template, &opts.output_dir)?;
    let stdout = std::io::stdout().lock();
    let mut stdout = std::io::BufWriter::new(stdout);
    serde_json::to_writer_pretty(&mut stdout, &template.system_config.additional_files)?;
    std::io::Write::write_all(&mut stdout, b"\n")?;
    std::io::Write::flush(&mut stdout)?;
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Install(opts) => install(opts).await,
        Opt::GenerateRepos(opts) => generate_repos(opts),
    }
}

#[test]
fn test_parse_install_args() {
    let o = Opt::try_parse_from([
        "imgcomposer",
        "install",
        "--template",
        "/src/minimal.yml",
        "--partitions",
        "/run/parts.json",
    ])
    .unwrap();
    let o = match o {
        Opt::Install(o) => o,
        o => panic!("Expected install opts, not {o:?}"),
    };
    assert_eq!(o.template.as_str(), "/src/minimal.yml");
    assert_eq!(o.partitions.as_str(), "/run/parts.json");
    assert!(o.config.is_none());

    assert!(Opt::try_parse_from(["imgcomposer", "install", "--template", "t.yml"]).is_err());
}

#[test]
fn test_parse_generate_repos_args() {
    let o = Opt::try_parse_from([
        "imgcomposer",
        "generate-repos",
        "--template",
        "t.yml",
        "--output-dir",
        "/tmp/out",
    ])
    .unwrap();
    match o {
        Opt::GenerateRepos(o) => assert_eq!(o.output_dir.as_str(), "/tmp/out"),
        o => panic!("Expected generate-repos opts, not {o:?}"),
    }
}
