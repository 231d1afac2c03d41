//! Process lifecycle: start, stop, restart, status.
//!
//! `start` forks into the background unless configured to stay in the
//! foreground; the live process takes the PID-file lock either way.
//! `stop`/`restart`/`status` act on a running instance from the outside.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, setsid, ForkResult, Pid};
use tracing::{info, warn};

use super::pidfile::{self, LockOutcome, PidFileLock};
use super::signals;
use crate::config::ClientConfig;
use crate::constants::STOP_GRACE;
use crate::error::{Error, Result};

/// What `start` decided for the calling process.
#[derive(Debug)]
pub enum StartOutcome {
    /// We are the parent of a forked daemon; return to the caller.
    Parent { child: i32 },
    /// We are the process that should enter the control loop, holding
    /// the single-instance lock.
    Run(PidFileLock),
}

/// Start the control client process.
///
/// Background mode forks; the parent gets `Parent` back immediately and
/// the child becomes the daemon: new session, root working directory,
/// cleared umask, signal handlers, then the PID-file lock and closed
/// standard streams. Foreground (and one-shot) mode does the handler
/// install and lock acquisition in the calling process.
pub fn start(config: &ClientConfig) -> Result<StartOutcome> {
    // One-shot runs never daemonize: they connect, refresh, and exit.
    let foreground = config.foreground || !config.remain_connected;

    let daemonized = if foreground {
        signals::install()?;
        false
    } else {
        match daemonize()? {
            Some(child) => return Ok(StartOutcome::Parent { child: child.as_raw() }),
            None => true,
        }
    };

    let lock = match pidfile::acquire(&config.pid_file)? {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::HeldBy(pid) => return Err(Error::ProcExists(pid)),
    };

    info!(pid = std::process::id(), daemonized, "starting SDP control client");

    if daemonized {
        close_standard_streams();
    }

    Ok(StartOutcome::Run(lock))
}

/// Stop a running instance.
///
/// Sends TERM and waits; a target that is still alive right after the
/// signal is not yet dead, so we poll for roughly [`STOP_GRACE`] before
/// escalating to KILL and polling again.
pub fn stop(pid_file: &Path) -> Result<()> {
    let pid = running_pid(pid_file, "stop")?;
    let target = Pid::from_raw(pid);

    match kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(Error::Filesystem {
                path: pid_file.display().to_string(),
                message: format!("failed to signal pid {pid}: {e}"),
            });
        }
    }

    if wait_for_exit(target, STOP_GRACE) {
        warn!(pid, "stopped SDP control client via SIGTERM");
        return Ok(());
    }

    warn!(pid, "instance ignored SIGTERM, escalating to SIGKILL");
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(Error::Filesystem {
                path: pid_file.display().to_string(),
                message: format!("failed to kill pid {pid}: {e}"),
            });
        }
    }

    if wait_for_exit(target, STOP_GRACE) {
        warn!(pid, "stopped SDP control client via SIGKILL");
        return Ok(());
    }

    Err(Error::State {
        operation: "stop",
        state: format!("pid {pid} still running after SIGKILL"),
    })
}

/// Restart a running instance in place by sending HUP; the target
/// re-reads its config without releasing the PID-file lock.
pub fn restart(pid_file: &Path) -> Result<()> {
    let pid = running_pid(pid_file, "restart")?;

    kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| Error::Filesystem {
        path: pid_file.display().to_string(),
        message: format!("failed to signal pid {pid}: {e}"),
    })?;

    warn!(pid, "sent restart signal to SDP control client");
    Ok(())
}

/// Report the running instance, if any.
///
/// Probes by trying the lock: contention proves a live holder; success
/// proves there is none, and the probe lock is released immediately.
pub fn status(pid_file: &Path) -> Result<Option<i32>> {
    match pidfile::acquire(pid_file)? {
        LockOutcome::HeldBy(pid) => Ok(Some(pid)),
        LockOutcome::Acquired(lock) => {
            drop(lock);
            Ok(None)
        }
    }
}

fn running_pid(pid_file: &Path, operation: &'static str) -> Result<i32> {
    pidfile::read_running_pid(pid_file)?.ok_or(Error::State {
        operation,
        state: "no running instance detected".into(),
    })
}

/// Fork off a daemon. Returns the child PID in the parent and `None` in
/// the child, which by then has its own session, the filesystem root as
/// working directory, a cleared umask, and signal handlers installed.
fn daemonize() -> Result<Option<Pid>> {
    umask(Mode::empty());

    match unsafe { fork() }.map_err(|e| Error::Fork {
        message: format!("fork failed: {e}"),
    })? {
        ForkResult::Parent { child } => Ok(Some(child)),
        ForkResult::Child => {
            setsid().map_err(|e| Error::Fork {
                message: format!("setsid failed: {e}"),
            })?;

            chdir("/").map_err(|e| Error::Filesystem {
                path: "/".into(),
                message: format!("chdir failed: {e}"),
            })?;

            signals::install()?;

            Ok(None)
        }
    }
}

fn close_standard_streams() {
    // Later opens must not land on the standard descriptors; detach them
    // onto /dev/null rather than leaving the slots free.
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        } else {
            libc::close(0);
            libc::close(1);
            libc::close(2);
        }
    }
}

/// Poll `pid` with signal 0 until it is gone or `grace` elapses.
fn wait_for_exit(pid: Pid, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match kill(pid, None) {
            Err(Errno::ESRCH) => return true,
            Ok(()) | Err(_) => {}
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
