//! PID-file locking.
//!
//! The PID file doubles as the single-instance token: an exclusive
//! advisory `flock(2)` held for the process lifetime. Contention is not
//! an error; it identifies the running instance.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::unistd::Uid;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Held PID-file lock. Dropping the value releases the lock; the daemon
/// keeps it alive for its whole lifetime, including across SIGHUP
/// re-initialization.
#[derive(Debug)]
pub struct PidFileLock {
    file: File,
    path: PathBuf,
}

impl PidFileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor, used by tests to assert the lock survives reinit.
    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

/// Outcome of a lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// We hold the lock; our PID is on disk.
    Acquired(PidFileLock),
    /// Another live instance holds the lock.
    HeldBy(i32),
}

/// Try to take the PID-file lock and record our PID.
///
/// Contention returns `HeldBy` with the owner's PID read from the file;
/// any other locking failure is fatal.
pub fn acquire(path: &Path) -> Result<LockOutcome> {
    verify_file_perms(path)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to open PID file: {e}"),
        })?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == -1 {
        let os_err = std::io::Error::last_os_error();
        if os_err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return match read_running_pid(path)? {
                Some(pid) => Ok(LockOutcome::HeldBy(pid)),
                None => Err(Error::Filesystem {
                    path: path.display().to_string(),
                    message: "PID file is locked but holds no readable PID".into(),
                }),
            };
        }
        return Err(Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to lock PID file: {os_err}"),
        });
    }

    let pid = std::process::id();
    debug!(pid, path = %path.display(), "writing PID to lock file");

    let written = (|| -> std::io::Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}")?;
        file.sync_all()
    })();
    if let Err(e) = written {
        return Err(Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to write PID: {e}"),
        });
    }

    Ok(LockOutcome::Acquired(PidFileLock {
        file,
        path: path.to_path_buf(),
    }))
}

/// Read the PID recorded in the file.
///
/// An absent or unreadable PID file means "no running instance", not an
/// error.
pub fn read_running_pid(path: &Path) -> Result<Option<i32>> {
    verify_file_perms(path)?;

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "PID file unreadable");
            return Ok(None);
        }
    };

    // Max PID on Linux is configurable but bounded well under 2^31.
    let pid = text.trim().parse::<i32>().ok().filter(|p| *p > 0);
    Ok(pid)
}

/// Check that `path` looks like a file this client owns: a regular file
/// or symlink, mode 0600, owned by the effective user.
///
/// Permission and ownership mismatches are logged as errors but do not
/// abort; a missing file is fine. Only a hard stat failure or a
/// non-regular file is fatal.
pub fn verify_file_perms(path: &Path) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::Filesystem {
                path: path.display().to_string(),
                message: format!("stat failed: {e}"),
            });
        }
    };

    if !meta.file_type().is_file() && !meta.file_type().is_symlink() {
        error!(
            path = %path.display(),
            "not a regular file or symbolic link"
        );
        return Err(Error::Filesystem {
            path: path.display().to_string(),
            message: "not a regular file or symbolic link".into(),
        });
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        error!(
            path = %path.display(),
            mode = format_args!("{mode:04o}"),
            "permissions should be user read/write only (0600)"
        );
    }

    let owner = meta.uid();
    let me = Uid::effective().as_raw();
    if owner != me {
        error!(
            path = %path.display(),
            owner,
            effective_uid = me,
            "file not owned by current effective user"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_pid_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");

        let outcome = acquire(&path).unwrap();
        let lock = match outcome {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::HeldBy(pid) => panic!("unexpected holder {pid}"),
        };

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", std::process::id()));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(lock);
    }

    #[test]
    fn second_acquire_reports_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");

        let first = acquire(&path).unwrap();
        assert!(matches!(first, LockOutcome::Acquired(_)));

        // flock is per open file description, so a second handle in the
        // same process contends just like a second process would.
        match acquire(&path).unwrap() {
            LockOutcome::HeldBy(pid) => assert_eq!(pid, std::process::id() as i32),
            LockOutcome::Acquired(_) => panic!("lock should be contended"),
        }
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");

        let first = acquire(&path).unwrap();
        drop(first);

        assert!(matches!(acquire(&path).unwrap(), LockOutcome::Acquired(_)));
    }

    #[test]
    fn read_running_pid_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");

        let _lock = acquire(&path).unwrap();
        let pid = read_running_pid(&path).unwrap();
        assert_eq!(pid, Some(std::process::id() as i32));
    }

    #[test]
    fn missing_pid_file_means_not_running() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.pid");
        assert_eq!(read_running_pid(&path).unwrap(), None);
    }

    #[test]
    fn garbage_pid_file_means_not_running() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");
        fs::write(&path, "not-a-pid\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        assert_eq!(read_running_pid(&path).unwrap(), None);
    }

    #[test]
    fn negative_or_zero_pid_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

        for bad in ["-5\n", "0\n"] {
            fs::write(&path, bad).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
            assert_eq!(read_running_pid(&path).unwrap(), None, "pid {bad:?}");
        }
    }

    #[test]
    fn verify_perms_accepts_missing_file() {
        verify_file_perms(Path::new("/nonexistent/never/sdpc.pid")).unwrap();
    }

    #[test]
    fn verify_perms_rejects_directory() {
        let dir = TempDir::new().unwrap();
        assert!(verify_file_perms(dir.path()).is_err());
    }

    #[test]
    fn verify_perms_logs_but_accepts_loose_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sdpc.pid");
        fs::write(&path, "123\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        // Wrong mode is logged, not fatal.
        verify_file_perms(&path).unwrap();
    }
}
