//! CLI command builder shared by the container and cluster backends.
//!
//! Every invocation is bounded by a timeout; a spawn failure or an expired
//! timeout is reported as [`BackendError::Unavailable`] so callers can treat
//! it as a retryable transport problem. A non-zero exit is *not* an error at
//! this layer: backends inspect stderr to classify it.

use crate::error::{BackendError, Result};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for a single backend CLI invocation.
#[derive(Clone)]
pub struct CliCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Duration,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout on success, otherwise the trimmed stderr.
    pub fn into_result(self) -> std::result::Result<String, String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(self.stderr.trim().to_string())
        }
    }
}

impl CliCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable in the child process environment. Values never appear
    /// in the argument list or in logs.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the command's stdin.
    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run to completion and capture output.
    pub async fn output(self) -> Result<CommandOutput> {
        debug!(command = %self, "running backend command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Unavailable(format!("failed to launch `{}`: {}", self.program, e))
        })?;

        if let Some(input) = self.stdin.as_deref() {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await.map_err(|e| {
                    BackendError::Unavailable(format!(
                        "failed to write to `{}` stdin: {}",
                        self.program, e
                    ))
                })?;
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BackendError::Unavailable(format!(
                    "`{}` did not finish within {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to wait for `{}`: {}", self.program, e))
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl fmt::Display for CliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliCommand")
            .field("command", &self.to_string())
            .field("env_keys", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("has_stdin", &self.stdin.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_spaced_args() {
        let cmd = CliCommand::new("podman")
            .arg("run")
            .arg("-v")
            .arg("/opt/Project Center:/pc:ro");
        assert_eq!(cmd.to_string(), "podman run -v '/opt/Project Center:/pc:ro'");
    }

    #[test]
    fn test_debug_hides_env_values() {
        let cmd = CliCommand::new("docker").env("PASSWORD", "hunter2");
        let rendered = format!("{cmd:?}");
        assert!(rendered.contains("PASSWORD"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let err = CliCommand::new("rpod-definitely-not-a-real-binary")
            .arg("version")
            .output()
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout_and_stdin() {
        let out = CliCommand::new("cat")
            .stdin("hello")
            .output()
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let err = CliCommand::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50))
            .output()
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
