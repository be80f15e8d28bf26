//! Wraps `btrfs receive` as an async sink for chunk bytes during restore.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};

use crate::pathenv::ensure_sbin_on_command_path;

#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("failed to spawn btrfs receive: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("btrfs receive exited with {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

/// A running `btrfs receive <dir>` child process, exposing its stdin as
/// an `AsyncWrite`. The caller streams chunk bytes into it, closes
/// stdin via `finish`, and inspects the exit status.
pub struct ReceiveProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    receive_dir: PathBuf,
}

impl ReceiveProcess {
    pub async fn spawn(receive_dir: &Path) -> Result<Self, ReceiveError> {
        let mut command = tokio::process::Command::new("btrfs");
        command.arg("receive").arg(receive_dir);
        command.stdin(Stdio::piped()).stderr(Stdio::piped());
        ensure_sbin_on_command_path(&mut command);

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ReceiveError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "missing child stdin",
            ))
        })?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            receive_dir: receive_dir.to_path_buf(),
        })
    }

    /// Writes a chunk's worth of bytes to stdin.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), ReceiveError> {
        let stdin = self
            .stdin
            .as_mut()
            .expect("write_chunk called after finish");
        stdin.write_all(data).await?;
        Ok(())
    }

    /// Closes stdin and waits for the process to exit, returning an
    /// error if it exited non-zero.
    pub async fn finish(mut self) -> Result<(), ReceiveError> {
        drop(self.stdin.take());
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ReceiveError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Closes stdin, then terminates the process (SIGTERM, then SIGKILL
    /// after `timeout`) and returns its captured stderr, for use when
    /// the chunk stream fails partway through.
    pub async fn kill_and_collect_stderr(mut self, timeout: Duration) -> String {
        drop(self.stdin.take());
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

    /// The subvolume directory `btrfs receive` will materialize once it
    /// finishes, named after the last path component of the stream's
    /// originating snapshot.
    pub fn received_subvolume_path(&self, snapshot_name: &str) -> PathBuf {
        self.receive_dir.join(snapshot_name)
    }
}

impl AsyncWrite for ReceiveProcess {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let stdin = this
            .stdin
            .as_mut()
            .expect("poll_write called after finish");
        std::pin::Pin::new(stdin).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let stdin = this
            .stdin
            .as_mut()
            .expect("poll_flush called after finish");
        std::pin::Pin::new(stdin).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let stdin = this
            .stdin
            .as_mut()
            .expect("poll_shutdown called after finish");
        std::pin::Pin::new(stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn received_subvolume_path_joins_receive_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Spawning a real `btrfs receive` isn't possible in a unit test
        // sandbox; this exercises the pure path-joining helper only.
        let process = ReceiveProcess {
            child: tokio::process::Command::new("true").spawn().unwrap(),
            stdin: None,
            receive_dir: dir.path().to_path_buf(),
        };
        let joined = process.received_subvolume_path("home__20260101T000000Z__full");
        assert_eq!(joined, dir.path().join("home__20260101T000000Z__full"));
    }
}
