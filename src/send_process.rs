//! Wraps `btrfs send` as an async byte stream.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout};

use crate::pathenv::ensure_sbin_on_command_path;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to spawn btrfs send: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("btrfs send exited with {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

/// A running `btrfs send [-p parent] <snapshot>` child process, exposing
/// its stdout as an `AsyncRead`. Dropping without calling `finish`
/// leaves the child to be reaped by `Child`'s own `Drop`; callers that
/// hit a stream error should call `kill_and_collect_stderr` first so the
/// failure's stderr is captured.
pub struct SendProcess {
    child: Child,
    stdout: ChildStdout,
}

impl SendProcess {
    pub async fn spawn(
        snapshot_path: &Path,
        parent_snapshot: Option<&Path>,
    ) -> Result<Self, StreamError> {
        let mut command = tokio::process::Command::new("btrfs");
        command.arg("send");
        if let Some(parent) = parent_snapshot {
            command.arg("-p").arg(parent);
        }
        command.arg(snapshot_path);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        ensure_sbin_on_command_path(&mut command);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| {
                StreamError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "missing child stdout",
                ))
            })?;
        Ok(Self { child, stdout })
    }

    /// Waits for the process to exit after stdout has been fully
    /// consumed, returning an error if it exited non-zero.
    pub async fn finish(mut self) -> Result<(), StreamError> {
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            return Err(StreamError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Terminates the process (SIGTERM, then SIGKILL after `timeout`)
    /// and returns its captured stderr, for use when the consumer of the
    /// stream fails partway through and the send process must be
    /// stopped rather than drained.
    pub async fn kill_and_collect_stderr(mut self, timeout: Duration) -> String {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        if tokio::time::timeout(timeout, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
        }
        match self.child.wait_with_output().await {
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            Err(_) => String::new(),
        }
    }
}

impl AsyncRead for SendProcess {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.stdout).poll_read(cx, buf)
    }
}
