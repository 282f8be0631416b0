//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};

/// Which pipe a line of child output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// The result of running a command with [`CommandRunExt::run_streaming`].
#[derive(Debug)]
pub struct StreamedOutput {
    /// Exit status of the child.
    pub status: ExitStatus,
    /// Standard output alone.
    pub stdout: String,
    /// Complete lines from both streams, in the order they were drained.
    pub combined: String,
}

impl StreamedOutput {
    /// Return the last `n` lines of output; useful for error messages.
    pub fn tail(&self, n: usize) -> String {
        let lines = self.combined.lines().collect::<Vec<_>>();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Execute the child with both output streams piped; each stream is drained
    /// on its own worker thread which forwards complete lines to tracing.
    /// The call returns once both streams hit EOF and the child has exited.
    /// A non-zero exit is *not* an error here; inspect [`StreamedOutput::status`].
    fn run_streaming(&mut self) -> Result<StreamedOutput>;
}

/// Forward lines of `r` to tracing and `combined`; returns the stream's own contents.
fn drain_lines(r: impl Read, stream: OutputStream, combined: &Mutex<String>) -> Result<String> {
    let mut r = BufReader::new(r);
    let mut own = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = r
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("Reading child {}", stream.as_str()))?;
        if n == 0 {
            return Ok(own);
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        tracing::debug!(stream = stream.as_str(), "{line}");
        own.push_str(line);
        own.push('\n');
        let mut combined = combined.lock().unwrap_or_else(PoisonError::into_inner);
        combined.push_str(line);
        combined.push('\n');
    }
}

fn join_drain(h: std::thread::ScopedJoinHandle<'_, Result<String>>) -> Result<String> {
    h.join()
        .map_err(|_| anyhow!("Output drain thread panicked"))?
}

impl CommandRunExt for Command {
    fn run_streaming(&mut self) -> Result<StreamedOutput> {
        tracing::trace!("exec: {self:?}");
        self.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn().context("Spawning child")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Missing child stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Missing child stderr"))?;
        let combined = Mutex::new(String::new());
        let drained = std::thread::scope(|s| {
            let combined = &combined;
            let out = s.spawn(move || drain_lines(stdout, OutputStream::Stdout, combined));
            let err = s.spawn(move || drain_lines(stderr, OutputStream::Stderr, combined));
            let out = join_drain(out);
            let err = join_drain(err);
            anyhow::Ok((out?, err?))
        });
        // Always reap the child, even if draining failed.
        let status = child.wait().context("Waiting for child")?;
        let (stdout, _) = drained?;
        let combined = combined
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(StreamedOutput {
            status,
            stdout,
            combined,
        })
    }
}
