//! Sticky signal flags.
//!
//! Signal handlers have no context pointer, so the six caught signals
//! land in process-scope atomics. The handlers do only async-signal-safe
//! work: set a flag, and for SIGCHLD reap children with a non-blocking
//! wait under errno save/restore. The control loop reads and clears the
//! flags at one point per iteration through [`take`]; nothing else in
//! the crate touches them.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};

static GOT_SIGNAL: AtomicBool = AtomicBool::new(false);
static GOT_SIGHUP: AtomicBool = AtomicBool::new(false);
static GOT_SIGINT: AtomicBool = AtomicBool::new(false);
static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);
static GOT_SIGUSR1: AtomicBool = AtomicBool::new(false);
static GOT_SIGUSR2: AtomicBool = AtomicBool::new(false);
static GOT_SIGCHLD: AtomicBool = AtomicBool::new(false);

const CAUGHT: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
];

extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGHUP => GOT_SIGHUP.store(true, Ordering::Relaxed),
        libc::SIGINT => GOT_SIGINT.store(true, Ordering::Relaxed),
        libc::SIGTERM => GOT_SIGTERM.store(true, Ordering::Relaxed),
        libc::SIGUSR1 => GOT_SIGUSR1.store(true, Ordering::Relaxed),
        libc::SIGUSR2 => GOT_SIGUSR2.store(true, Ordering::Relaxed),
        libc::SIGCHLD => {
            let saved = Errno::last_raw();
            GOT_SIGCHLD.store(true, Ordering::Relaxed);
            // Reap any exited children; waitpid may clobber errno.
            unsafe {
                while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
            }
            Errno::set_raw(saved);
        }
        _ => return,
    }
    // Master flag last, so a consumer that sees it also sees the
    // per-signal flag.
    GOT_SIGNAL.store(true, Ordering::Release);
}

/// Install the handlers for all six caught signals and clear any stale
/// flags. Uses restartable syscall semantics and an empty handler mask.
pub fn install() -> Result<()> {
    for flag in [
        &GOT_SIGNAL,
        &GOT_SIGHUP,
        &GOT_SIGINT,
        &GOT_SIGTERM,
        &GOT_SIGUSR1,
        &GOT_SIGUSR2,
        &GOT_SIGCHLD,
    ] {
        flag.store(false, Ordering::SeqCst);
    }

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in CAUGHT {
        unsafe { sigaction(sig, &action) }.map_err(|e| Error::Fork {
            message: format!("failed to install {sig:?} handler: {e}"),
        })?;
    }

    Ok(())
}

/// Which signals arrived since the last [`take`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSignals {
    pub hup: bool,
    pub int: bool,
    pub term: bool,
    pub usr1: bool,
    pub usr2: bool,
    pub chld: bool,
}

/// Read and clear the sticky flags. Returns `None` when no signal has
/// arrived since the previous call.
pub fn take() -> Option<PendingSignals> {
    if !GOT_SIGNAL.swap(false, Ordering::Acquire) {
        return None;
    }

    Some(PendingSignals {
        hup: GOT_SIGHUP.swap(false, Ordering::Relaxed),
        int: GOT_SIGINT.swap(false, Ordering::Relaxed),
        term: GOT_SIGTERM.swap(false, Ordering::Relaxed),
        usr1: GOT_SIGUSR1.swap(false, Ordering::Relaxed),
        usr2: GOT_SIGUSR2.swap(false, Ordering::Relaxed),
        chld: GOT_SIGCHLD.swap(false, Ordering::Relaxed),
    })
}
