//! Error types for sdpc-core.

use thiserror::Error;

/// Main error type for SDP control client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a context that has not completed configuration.
    #[error("control client not initialized: {message}")]
    Uninitialized { message: String },

    /// fork() or a sibling daemonization step failed.
    #[error("daemonize failed: {message}")]
    Fork { message: String },

    /// Open/lock/read/write/stat against the PID or credential files.
    #[error("filesystem operation failed on {path}: {message}")]
    Filesystem { path: String, message: String },

    /// The PID-file lock is held by another live instance.
    #[error("an instance is already running (pid={0})")]
    ProcExists(i32),

    /// Request attempted while disconnected.
    #[error("not connected to controller")]
    ConnDown,

    /// Request attempted in a state that disallows it.
    #[error("invalid state for {operation}: {state}")]
    State { operation: &'static str, state: String },

    /// Transport or codec failure during a keep-alive exchange.
    #[error("keep-alive exchange failed: {message}")]
    KeepAlive { message: String },

    /// Transport or codec failure during a credential exchange.
    #[error("credential exchange failed: {message}")]
    CredReq { message: String },

    /// Exceeded the maximum request attempts without a reply.
    #[error("too many failed requests to controller")]
    ManyFailedReqs,

    /// Loop exit due to SIGINT/SIGTERM.
    #[error("received exit signal")]
    GotExitSig,

    /// Configuration file error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed or oversized wire message.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },
}

impl Error {
    /// Returns true if this error ends the run loop rather than the
    /// current iteration.
    ///
    /// Fatal errors are the terminal outcomes of the state machine and
    /// signal handling; everything else is retried by the outer loop's
    /// reconnect policy or the request backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ManyFailedReqs
                | Error::GotExitSig
                | Error::ProcExists(_)
                | Error::Uninitialized { .. }
        )
    }

    /// Returns true for errors the loop records as a failed request
    /// attempt instead of aborting.
    pub fn counts_as_failed_request(&self) -> bool {
        matches!(
            self,
            Error::Filesystem { .. } | Error::KeepAlive { .. } | Error::CredReq { .. }
        )
    }
}

/// Convenience result type for sdpc operations.
pub type Result<T> = std::result::Result<T, Error>;
