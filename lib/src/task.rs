//! # Running external commands
//!
//! A [`Task`] describes one command: what it is for, what to run, and whether it
//! runs privileged and/or inside a chroot.  An [`Executor`] runs it.  Every stage
//! of the installation goes through an executor, so the whole pipeline can be
//! driven against a recording executor in tests.

use std::fmt::Display;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use imgcomposer_utils::{CommandRunExt, ShellQuotedArgs};

use crate::error::InstallError;

/// How many lines of output to keep in a failure message
const OUTPUT_TAIL_LINES: usize = 20;

/// A command to execute.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) description: String,
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) chroot: Option<Utf8PathBuf>,
    pub(crate) privileged: bool,
    pub(crate) quiet: bool,
}

impl Task {
    /// Create a new task; `description` is logged and used in errors.
    pub fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self {
            description: description.as_ref().to_string(),
            program: exe.as_ref().to_string(),
            args: Vec::new(),
            env: Vec::new(),
            chroot: None,
            privileged: false,
            quiet: false,
        }
    }

    /// Don't log the description at info level.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Append arguments.
    pub fn args<S: AsRef<str>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }

    /// Run via `sudo` unless we are already root.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Run inside `root` via `chroot`; this implies [`Self::privileged`].
    pub fn chroot(mut self, root: &Utf8Path) -> Self {
        self.chroot = Some(root.to_owned());
        self.privileged = true;
        self
    }

    /// The program being run (inside the chroot, if any).
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments to the program.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// The chroot the program runs in, if any.
    pub fn chroot_dir(&self) -> Option<&Utf8Path> {
        self.chroot.as_deref()
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Render the full argument vector, including `sudo` and `chroot` prefixes.
    pub(crate) fn render_argv(&self, as_root: bool, proxies: &[(String, String)]) -> Vec<String> {
        let mut argv = Vec::new();
        if self.privileged && !as_root {
            argv.push("sudo".to_string());
            let names = proxies
                .iter()
                .chain(self.env.iter())
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>();
            if !names.is_empty() {
                argv.push(format!("--preserve-env={}", names.join(",")));
            }
        }
        if let Some(root) = self.chroot.as_deref() {
            argv.push("chroot".to_string());
            argv.push(root.to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// The argument vector as it would be executed on this host.
    pub fn argv(&self) -> Vec<String> {
        self.render_argv(running_as_root(), &proxy_env())
    }

    /// Build a [`Command`] for this task.
    pub fn to_command(&self) -> Command {
        let proxies = proxy_env();
        let mut argv = self.render_argv(running_as_root(), &proxies).into_iter();
        let mut cmd = Command::new(argv.next().unwrap_or_else(|| self.program.clone()));
        cmd.args(argv);
        // Set these explicitly too, so they reach the chroot context even
        // when sudo is not involved.
        cmd.envs(proxies);
        cmd.envs(self.env.iter().cloned());
        cmd
    }

    /// Convenience wrapper for [`Executor::execute`].
    pub fn run(self, executor: &dyn Executor) -> Result<String> {
        executor.execute(&self)
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ShellQuotedArgs::new(&self.argv()).fmt(f)
    }
}

/// Proxy configuration from our environment (`http_proxy`, `HTTPS_PROXY`, `no_proxy`, ...),
/// sorted by name.
pub(crate) fn proxy_env() -> Vec<(String, String)> {
    let mut r = std::env::vars()
        .filter(|(k, _)| k.to_ascii_lowercase().ends_with("_proxy"))
        .collect::<Vec<_>>();
    r.sort();
    r
}

fn running_as_root() -> bool {
    rustix::process::geteuid().is_root()
}

/// Runs tasks.
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Run the task to completion, returning its standard output.  A task which
    /// exits unsuccessfully is an [`InstallError::CommandFailure`] carrying the
    /// tail of both streams.
    fn execute(&self, task: &Task) -> Result<String>;
}

/// Runs tasks as child processes of this one.
#[derive(Debug, Default)]
pub struct HostExecutor;

impl Executor for HostExecutor {
    fn execute(&self, task: &Task) -> Result<String> {
        let description = task.description();
        if !task.quiet {
            tracing::info!("{description}");
        }
        tracing::debug!("exec: {task}");
        let o = task
            .to_command()
            .run_streaming()
            .with_context(|| format!("Executing {description}"))?;
        if !o.status.success() {
            return Err(InstallError::CommandFailure {
                description: description.to_string(),
                status: o.status.to_string(),
                output: o.tail(OUTPUT_TAIL_LINES),
            }
            .into());
        }
        Ok(o.stdout)
    }
}
