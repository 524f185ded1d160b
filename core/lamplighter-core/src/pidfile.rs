//! Liveness marker for external process supervision.
//!
//! Created exclusively at startup and removed exactly once on clean
//! shutdown. A leftover file naming a dead pid is stale and replaced.

use fs_err as fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{LamplighterError, Result};

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    released: bool,
}

impl PidFile {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error("create pidfile directory", err))?;
        }

        match write_exclusive(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_pid(&path) {
                    Some(pid) if is_pid_alive(pid) => {
                        return Err(LamplighterError::Io {
                            context: format!("already running with pid {} ({})", pid, path.display()),
                            source: err,
                        });
                    }
                    stale => {
                        tracing::warn!(path = %path.display(), pid = ?stale, "Replacing stale pidfile");
                        fs::remove_file(&path).map_err(|err| io_error("remove stale pidfile", err))?;
                        write_exclusive(&path).map_err(|err| io_error("write pidfile", err))?;
                    }
                }
            }
            Err(err) => return Err(io_error("write pidfile", err)),
        }

        tracing::debug!(path = %path.display(), pid = std::process::id(), "Wrote pidfile");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove pidfile", err)),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            tracing::warn!(error = %err, "Failed to remove pidfile");
        }
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Zero and anything that wraps negative would address a process
        // group, not one process.
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 only checks that the pid exists.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0 && i32::try_from(*pid).is_ok())
}

fn write_exclusive(path: &Path) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn io_error(context: &str, source: std::io::Error) -> LamplighterError {
    LamplighterError::Io {
        context: context.to_string(),
        source,
    }
}
