use crate::LockParams;
use log::debug;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Could not open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Could not lock {path}: {source}")]
    Flock { path: PathBuf, source: io::Error },
    #[error("Timed out after {waited:?} waiting for the lock on {path}")]
    Timeout { path: PathBuf, waited: Duration },
}

/// An open store file holding an exclusive `flock`.
///
/// The lock is released when the guard is dropped, which covers early returns,
/// errors and unwinding panics alike. Closing the descriptor would release it too.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Opens (creating if needed) `path` and waits for an exclusive lock on it.
    pub fn acquire(path: &Path, params: &LockParams) -> Result<Self, LockError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut params = params.clone();
        params.reset_poll_period();

        let started = Instant::now();

        loop {
            match try_lock_exclusive(&file) {
                Ok(true) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(LockError::Flock {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            let waited = started.elapsed();

            if waited >= params.timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }

            debug!(
                "{} is locked by another invocation, retrying in {:?}",
                path.display(),
                params.poll_period
            );

            thread::sleep(params.poll_period.min(params.timeout - waited));
            params.maybe_increase_poll_period();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(error) = unlock(&self.file) {
            debug!("Failed to unlock {}: {}", self.path.display(), error);
        }
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if rc == 0 {
            return Ok(true);
        }

        let error = io::Error::last_os_error();

        match error.raw_os_error() {
            Some(libc::EWOULDBLOCK) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(error),
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };

    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "advisory file locks are only supported on unix",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
