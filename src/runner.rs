//! External command execution with deadline enforcement.
//!
//! Every child process started by the sync engine goes through
//! [`CommandRunner`], which captures stdout/stderr, injects the process-wide
//! environment additions (private gitconfig, SSH command), and kills the
//! child if the owning pass runs out of time.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

use crate::paths::AbsPath;

/// Time budget shared by all work in one sync pass.
///
/// Children receive whatever is left of the budget at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// No deadline; operations may run indefinitely.
    pub fn unlimited() -> Self {
        Self(None)
    }

    /// Time left on the budget. `None` means unlimited; an expired deadline
    /// reports `Some(ZERO)`.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Why a command invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("can't start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out: {program} {args}")]
    Timeout { program: String, args: String },

    #[error("command failed: {program} {args} (status {status}): {stderr}")]
    Exit {
        program: String,
        args: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("i/o error running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a successful invocation, with trailing whitespace
/// stripped.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
///
/// Cloning is cheap; clones share the same environment additions.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    envs: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable passed to every child.
    pub fn with_env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Run `program` with `args`, capturing output.
    pub async fn run(
        &self,
        deadline: Deadline,
        cwd: Option<&AbsPath>,
        program: &str,
        args: &[&str],
    ) -> Result<CmdOutput, RunnerError> {
        self.exec(deadline, cwd, None, program, args).await
    }

    /// Run `program` with `args`, writing `stdin` to the child first.
    pub async fn run_with_stdin(
        &self,
        deadline: Deadline,
        cwd: Option<&AbsPath>,
        stdin: &str,
        program: &str,
        args: &[&str],
    ) -> Result<CmdOutput, RunnerError> {
        self.exec(deadline, cwd, Some(stdin), program, args).await
    }

    async fn exec(
        &self,
        deadline: Deadline,
        cwd: Option<&AbsPath>,
        stdin: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> Result<CmdOutput, RunnerError> {
        trace!(program, ?args, cwd = ?cwd.map(|p| p.to_string()), "running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the pass deadline fires, dropping the child kills and reaps it.
            .kill_on_drop(true);
        for (key, val) in &self.envs {
            cmd.env(key, val);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir.as_path());
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|source| RunnerError::Io {
                        program: program.to_string(),
                        source,
                    })?;
                // Dropping the handle closes the pipe so the child sees EOF.
            }
        }

        let wait = child.wait_with_output();
        let output = match deadline.remaining() {
            Some(left) => tokio::time::timeout(left, wait)
                .await
                .map_err(|_| RunnerError::Timeout {
                    program: program.to_string(),
                    args: args.join(" "),
                })?,
            None => wait.await,
        }
        .map_err(|source| RunnerError::Io {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr)
            .trim_end()
            .to_string();

        if !output.status.success() {
            return Err(RunnerError::Exit {
                program: program.to_string(),
                args: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        trace!(program, "command succeeded");
        Ok(CmdOutput { stdout, stderr })
    }
}
