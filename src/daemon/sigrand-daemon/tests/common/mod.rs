#![allow(dead_code)]

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sigrand_daemon::DaemonConfig;
use tempfile::TempDir;

/// Temporary source file, named pipe and lock path
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new(entries: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Self { dir };
        workspace.write_source(entries);

        let c_path = CString::new(workspace.fifo().as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(rc, 0, "mkfifo failed: {}", io::Error::last_os_error());

        workspace
    }

    pub fn write_source(&self, entries: &[&str]) {
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(entry);
            contents.push_str("%%\n");
        }
        fs::write(self.source(), contents).unwrap();
    }

    pub fn source(&self) -> PathBuf {
        self.dir.path().join("sigfile")
    }

    pub fn fifo(&self) -> PathBuf {
        self.dir.path().join("signature")
    }

    pub fn lock(&self) -> PathBuf {
        self.dir.path().join("sigrandpid")
    }

    pub fn config(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.paths.source = self.source().to_string_lossy().into_owned();
        config.paths.fifo = self.fifo().to_string_lossy().into_owned();
        config.paths.lock = self.lock().to_string_lossy().into_owned();
        config.selection.seed = Some(12345);
        config.server.pause_ms = 10;
        config.server.poll_interval_ms = 5;
        config
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
