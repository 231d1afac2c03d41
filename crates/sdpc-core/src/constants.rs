//! Protocol and configuration constants for the SDP control client.

use std::time::Duration;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum framed message size on the control channel (1 MiB).
///
/// Credential payloads are a few KiB of PEM; anything near this limit is a
/// protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum length of the controller address string.
pub const MAX_SERVER_STR_LEN: usize = 50;

/// Maximum length of a config file line.
pub const MAX_LINE_LEN: usize = 1024;

/// Maximum raw SPA key length in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// Maximum base64-encoded SPA key length.
pub const MAX_B64_KEY_LEN: usize = 180;

// =============================================================================
// Queue / Delay Caps
// =============================================================================

/// Hard cap on the inbound message queue length.
pub const MAX_MSG_Q_LEN: u32 = 100;

/// Hard cap on the post-SPA delay.
pub const MAX_POST_SPA_DELAY: Duration = Duration::from_secs(10);

// =============================================================================
// Defaults
// =============================================================================

/// Default controller port.
pub const DEFAULT_CTRL_PORT: u16 = 5000;

/// Default fwknoprc stanza holding the controller SPA keys.
pub const DEFAULT_CTRL_STANZA: &str = "controller";

/// Default UDP port for the SPA knock.
pub const DEFAULT_SPA_PORT: u16 = 62201;

/// Default inbound messages drained per loop iteration.
pub const DEFAULT_MSG_Q_LEN: u32 = 10;

/// Default delay between the SPA knock and the TLS connect.
pub const DEFAULT_POST_SPA_DELAY: Duration = Duration::new(0, 500_000_000);

/// Default socket read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default socket write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval between credential refresh requests.
pub const DEFAULT_CRED_UPDATE_INTERVAL: Duration = Duration::from_secs(7200);

/// Default interval between access refresh requests (gateway builds).
pub const DEFAULT_ACCESS_UPDATE_INTERVAL: Duration = Duration::from_secs(86400);

/// Default interval between keep-alive probes.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default connection attempts per connect cycle.
pub const DEFAULT_MAX_CONN_ATTEMPTS: u32 = 3;

/// Default spacing between connection attempts.
pub const DEFAULT_INIT_CONN_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default request attempts before giving up.
pub const DEFAULT_MAX_REQUEST_ATTEMPTS: u32 = 3;

/// Default initial request retry interval (doubles on each retry).
pub const DEFAULT_INIT_REQUEST_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Default PID file location.
pub const DEFAULT_PID_FILE: &str = "/var/run/sdpc.pid";

/// Timeout for a single TCP connect attempt to the controller.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outer loop tick.
pub const LOOP_TICK: Duration = Duration::from_secs(1);

/// How long `stop` waits for an instance to exit before escalating.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_exceed_defaults() {
        assert!(DEFAULT_MSG_Q_LEN <= MAX_MSG_Q_LEN);
        assert!(DEFAULT_POST_SPA_DELAY <= MAX_POST_SPA_DELAY);
        assert!(MAX_KEY_LEN < MAX_B64_KEY_LEN);
    }

    #[test]
    fn retry_intervals_are_positive() {
        assert!(DEFAULT_INIT_REQUEST_RETRY_INTERVAL > Duration::ZERO);
        assert!(DEFAULT_INIT_CONN_RETRY_INTERVAL > Duration::ZERO);
    }
}
