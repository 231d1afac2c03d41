//! Transport facade for the controller session.
//!
//! The control loop never touches sockets; it drives a [`ControlChannel`]
//! and observes only connection state and framed envelope text. The
//! production implementation is [`tls::TlsChannel`]; tests substitute a
//! scripted channel.

pub mod spa;
pub mod tls;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::Result;

/// Connection state observable by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnState::Connected)
    }
}

/// Everything a channel needs to reach the controller.
///
/// Derived from [`ClientConfig`]; rebuilt and handed back through
/// [`ControlChannel::reconfigure`] on SIGHUP.
#[derive(Debug, Clone)]
pub struct ComSettings {
    pub ctrl_addr: String,
    pub ctrl_port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub use_spa: bool,
    pub spa_encryption_key: Option<String>,
    pub spa_hmac_key: Option<String>,
    pub post_spa_delay: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_conn_attempts: u32,
    pub init_conn_retry_interval: Duration,
}

impl ComSettings {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            ctrl_addr: cfg.ctrl_addr.clone(),
            ctrl_port: cfg.ctrl_port,
            cert_file: cfg.cert_file.clone(),
            key_file: cfg.key_file.clone(),
            use_spa: cfg.use_spa,
            spa_encryption_key: cfg.spa_encryption_key.clone(),
            spa_hmac_key: cfg.spa_hmac_key.clone(),
            post_spa_delay: cfg.post_spa_delay,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            max_conn_attempts: cfg.max_conn_attempts,
            init_conn_retry_interval: cfg.init_conn_retry_interval,
        }
    }
}

/// Narrow contract over the controller session.
pub trait ControlChannel {
    /// Establish the session: SPA knock (when configured), post-SPA
    /// delay, then the TLS connect with facade-internal retries. The
    /// loop observes only the final outcome.
    fn connect(&mut self) -> Result<()>;

    /// Tear the session down. Idempotent.
    fn disconnect(&mut self);

    /// Transmit one framed envelope; may block up to the write timeout.
    fn send_msg(&mut self, msg: &str) -> Result<()>;

    /// Non-blocking poll for at most one queued inbound envelope.
    /// `Ok(None)` means nothing queued, not an error.
    fn get_msg(&mut self) -> Result<Option<String>>;

    /// Current connection state.
    fn conn_state(&self) -> ConnState;

    /// Replace the in-memory SPA keys. Called by the credential store
    /// only after the on-disk rotation has fully succeeded.
    fn set_spa_keys(&mut self, encryption_key: &str, hmac_key: &str) -> Result<()>;

    /// Drop any live session and adopt new settings in place. This is
    /// the SIGHUP path: the owning slot is reused, never swapped out.
    fn reconfigure(&mut self, settings: ComSettings) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_state_default_is_disconnected() {
        assert_eq!(ConnState::default(), ConnState::Disconnected);
        assert!(!ConnState::Disconnected.is_connected());
        assert!(ConnState::Connected.is_connected());
    }
}
