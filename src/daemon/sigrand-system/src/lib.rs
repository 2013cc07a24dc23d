//! Sigrand System Integration
//!
//! Thin layer over the operating system: the rendezvous named pipe, the
//! lock file that keeps a single daemon alive, and process signalling for
//! the `stop`/`status` commands.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

/// Errors raised by the system layer
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Pipe not found! Try `mkfifo -m u=rw '{}'`", .path.display())]
    PipeNotFound { path: PathBuf },
    #[error("{} must be a named pipe! Try `mkfifo -m u=rw '{}'`", .path.display(), .path.display())]
    NotAPipe { path: PathBuf },
    #[error("Cannot inspect pipe {}: {source}", .path.display())]
    PipeInspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot open pipe {} for writing: {source}", .path.display())]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Found lock file {}{}; exiting", .path.display(), describe_pid(.pid))]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
    #[error("Error writing lock file {}: {source}", .path.display())]
    LockWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot read lock file {}: {source}", .path.display())]
    LockRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

fn describe_pid(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

/// Verify that `path` exists and is a named pipe.
pub fn check_fifo<P: AsRef<Path>>(path: P) -> Result<(), SystemError> {
    let path = path.as_ref();
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SystemError::PipeNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(SystemError::PipeInspect {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !metadata.file_type().is_fifo() {
        return Err(SystemError::NotAPipe {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Open the write side of the pipe, waiting until a reader shows up.
///
/// The open itself is non-blocking: while nobody has the read side open the
/// kernel answers `ENXIO` and we retry every `poll_interval`. The returned
/// future can therefore be dropped at any time, which lets callers race it
/// against a shutdown signal.
pub async fn open_fifo_writer<P: AsRef<Path>>(
    path: P,
    poll_interval: Duration,
) -> Result<pipe::Sender, SystemError> {
    let path = path.as_ref();
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => {
                debug!("Reader connected to {}", path.display());
                return Ok(sender);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
            Err(source) => {
                return Err(SystemError::PipeOpen {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Exclusive lock file holding the daemon's pid.
///
/// The file is created with `O_EXCL`, so its existence is the whole
/// exclusion protocol. It is removed on [`LockFile::release`] or, failing
/// that, when the guard is dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockFile {
    /// Create the lock file and record the current pid in it
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, SystemError> {
        let path = path.as_ref();
        let pid = std::process::id();

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_lock_pid(path).ok().flatten();
                return Err(SystemError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid: holder,
                });
            }
            Err(source) => {
                return Err(SystemError::LockWrite {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let lock = Self {
            path: path.to_path_buf(),
            pid,
            released: false,
        };

        // from here on the guard cleans up if the write fails
        writeln!(file, "{pid}")
            .and_then(|_| file.sync_all())
            .map_err(|source| SystemError::LockWrite {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Wrote lock file {} (pid {})", lock.path.display(), pid);
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock file
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed lock file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Lock file {} already gone", self.path.display());
            }
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Read the pid recorded in a lock file.
///
/// Returns `Ok(None)` when the file does not exist or does not hold a pid.
pub fn read_lock_pid<P: AsRef<Path>>(path: P) -> Result<Option<u32>, SystemError> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SystemError::LockRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Check whether a process with `pid` exists (signal 0 probe).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: kill with signal 0 performs only the existence/permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM (or SIGKILL when `force`) to `pid`.
pub fn signal_process(pid: u32, force: bool) -> Result<(), SystemError> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| SystemError::Signal {
            pid,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };

    // SAFETY: plain syscall wrapper, arguments validated above
    if unsafe { libc::kill(raw, signal) } != 0 {
        return Err(SystemError::Signal {
            pid,
            source: io::Error::last_os_error(),
        });
    }

    debug!("Sent signal {} to pid {}", signal, pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::tempdir;

    fn make_fifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(rc, 0, "mkfifo failed: {}", io::Error::last_os_error());
    }

    #[test]
    fn test_check_fifo_missing() {
        let dir = tempdir().unwrap();
        let err = check_fifo(dir.path().join("signature")).unwrap_err();
        assert!(matches!(err, SystemError::PipeNotFound { .. }));
        assert!(err.to_string().contains("mkfifo -m u=rw"));
    }

    #[test]
    fn test_check_fifo_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signature");
        fs::write(&path, "not a pipe").unwrap();
        assert!(matches!(
            check_fifo(&path),
            Err(SystemError::NotAPipe { .. })
        ));
    }

    #[test]
    fn test_check_fifo_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signature");
        make_fifo(&path);
        check_fifo(&path).unwrap();
    }

    #[test]
    fn test_lock_acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sigrand.pid");

        let lock = LockFile::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );
        assert_eq!(lock.pid(), std::process::id());
        assert_eq!(lock.path(), path.as_path());

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_lock_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sigrand.pid");
        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_lock_is_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sigrand.pid");
        fs::write(&path, "4242\n").unwrap();

        match LockFile::acquire(&path).unwrap_err() {
            SystemError::AlreadyRunning { pid, .. } => assert_eq!(pid, Some(4242)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");
    }

    #[test]
    fn test_lock_in_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("sigrand.pid");
        assert!(matches!(
            LockFile::acquire(&path),
            Err(SystemError::LockWrite { .. })
        ));
    }

    #[test]
    fn test_read_lock_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sigrand.pid");
        assert_eq!(read_lock_pid(&path).unwrap(), None);

        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_lock_pid(&path).unwrap(), None);

        fs::write(&path, "123\n").unwrap();
        assert_eq!(read_lock_pid(&path).unwrap(), Some(123));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[tokio::test]
    async fn test_open_fifo_writer_waits_for_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signature");
        make_fifo(&path);

        let reader_path = path.clone();
        let reader = std::thread::spawn(move || fs::read(reader_path).unwrap());

        let mut sender = open_fifo_writer(&path, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut sender, b"hello\n")
            .await
            .unwrap();
        drop(sender);

        assert_eq!(reader.join().unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_open_fifo_writer_rejects_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signature");
        fs::write(&path, "").unwrap();

        let result = open_fifo_writer(&path, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SystemError::PipeOpen { .. })));
    }
}
