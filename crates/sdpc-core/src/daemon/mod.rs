//! Daemon plumbing: PID-file locking, signal flags, process lifecycle.

pub mod lifecycle;
pub mod pidfile;
pub mod signals;

pub use lifecycle::{restart, start, status, stop, StartOutcome};
pub use pidfile::{LockOutcome, PidFileLock};
pub use signals::PendingSignals;
