//! Process-wide exclusion with stale-holder recovery.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock already held by pid {0}")]
    HeldByLivePid(String),
    #[error("io error acquiring lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A scoped mutual-exclusion primitive keyed by a filesystem path.
///
/// One holder per lock path per host. The acquirer must call `release`
/// on every exit path; `Drop` also releases defensively.
pub struct LockFile {
    path: PathBuf,
    active: bool,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            active: false,
        }
    }

    pub fn acquire(&mut self) -> Result<(), LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let pid = std::process::id();
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                write!(file, "{pid}").map_err(|source| LockError::Io {
                    path: self.path.clone(),
                    source,
                })?;
                self.active = true;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                self.recover_stale_or_fail()
            }
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn recover_stale_or_fail(&mut self) -> Result<(), LockError> {
        let existing_pid = read_pid(&self.path);
        if let Some(pid) = existing_pid {
            if is_process_alive(pid) {
                return Err(LockError::HeldByLivePid(pid.to_string()));
            }
        } else {
            // Empty/corrupt pid file: treat as stale too.
        }
        fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        let pid = std::process::id();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => {
                    LockError::HeldByLivePid(read_pid(&self.path).map_or_else(
                        || "unknown".to_string(),
                        |pid| pid.to_string(),
                    ))
                }
                _ => LockError::Io {
                    path: self.path.clone(),
                    source,
                },
            })?;
        write!(file, "{pid}").map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.active = true;
        Ok(())
    }

    pub fn release(&mut self) {
        if !self.active {
            return;
        }
        let _ = fs::remove_file(&self.path);
        self.active = false;
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Checks whether `pid` names a live process by sending signal 0, the
/// standard Unix liveness probe (no signal is actually delivered).
fn is_process_alive(pid: i32) -> bool {
    // SAFETY: `kill` with signal 0 performs no action beyond error checking.
    unsafe { libc::kill(pid, 0) == 0 }
}
