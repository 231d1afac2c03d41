//! Single Packet Authorization knock.
//!
//! One authenticated UDP datagram asks the controller's gateway to open
//! the control port to this sender before the TLS connect. Packet
//! construction proper belongs to the SPA library on the controller
//! side; the client emits a nonce + timestamp body authenticated with
//! the SPA HMAC key.

use std::net::UdpSocket;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use ring::hmac;

use crate::constants::{DEFAULT_SPA_PORT, MAX_KEY_LEN};
use crate::error::{Error, Result};

const NONCE_LEN: usize = 16;

/// Emit one SPA knock toward the controller host.
pub fn send_knock(ctrl_addr: &str, hmac_key: &str) -> Result<()> {
    let packet = build_knock(hmac_key)?;

    let sock = UdpSocket::bind("0.0.0.0:0").map_err(|e| Error::Transport {
        message: format!("failed to bind SPA socket: {e}"),
    })?;

    sock.send_to(packet.as_bytes(), (ctrl_addr, DEFAULT_SPA_PORT))
        .map_err(|e| Error::Transport {
            message: format!("failed to send SPA packet to {ctrl_addr}: {e}"),
        })?;

    Ok(())
}

/// Build the knock payload: `base64(nonce):timestamp:base64(hmac)`.
fn build_knock(hmac_key: &str) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Transport {
            message: format!("system clock before epoch: {e}"),
        })?
        .as_secs();

    let body = format!("{}:{ts}", BASE64.encode(nonce));

    // Keys arrive base64-encoded from the controller; accept raw text
    // for hand-provisioned configs.
    let key_bytes = BASE64
        .decode(hmac_key)
        .unwrap_or_else(|_| hmac_key.as_bytes().to_vec());
    if key_bytes.len() > MAX_KEY_LEN {
        return Err(Error::Config {
            message: format!("SPA HMAC key exceeds {MAX_KEY_LEN} bytes"),
        });
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
    let tag = hmac::sign(&key, body.as_bytes());

    Ok(format!("{body}:{}", BASE64.encode(tag.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knock_has_three_fields() {
        let packet = build_knock("aG1hYy1rZXk=").unwrap();
        let fields: Vec<&str> = packet.split(':').collect();
        assert_eq!(fields.len(), 3);

        // nonce and tag decode as base64, timestamp parses
        assert_eq!(BASE64.decode(fields[0]).unwrap().len(), NONCE_LEN);
        assert!(fields[1].parse::<u64>().is_ok());
        assert_eq!(BASE64.decode(fields[2]).unwrap().len(), 32);
    }

    #[test]
    fn knock_is_nonce_unique() {
        let a = build_knock("key").unwrap();
        let b = build_knock("key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tag_depends_on_key() {
        // Same body would verify differently under a different key; the
        // cheap observable here is that two packets under distinct keys
        // with forced-equal bodies differ only in the tag, so just check
        // the verification path.
        let packet = build_knock("a2V5LW9uZQ==").unwrap();
        let fields: Vec<&str> = packet.split(':').collect();
        let body = format!("{}:{}", fields[0], fields[1]);

        let key_bytes = BASE64.decode("a2V5LW9uZQ==").unwrap();
        let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
        let tag = BASE64.decode(fields[2]).unwrap();
        assert!(hmac::verify(&key, body.as_bytes(), &tag).is_ok());

        let wrong = hmac::Key::new(hmac::HMAC_SHA256, b"another-key");
        assert!(hmac::verify(&wrong, body.as_bytes(), &tag).is_err());
    }
}
