//! TLS control channel.
//!
//! Mutually authenticated TLS over TCP to the controller. Connect is
//! optionally preceded by an SPA knock and always bounded by the
//! configured attempt count; the caller sees only the final outcome.
//!
//! The controller certificate is not chain-verified: the control port is
//! gated by SPA and the controller authenticates this client by its
//! certificate, mirroring the deployment model of the surrounding SDP
//! tooling.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as crypto_ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use tracing::{debug, warn};

use super::{spa, ComSettings, ConnState, ControlChannel};
use crate::constants::{CONNECT_TIMEOUT, MAX_B64_KEY_LEN};
use crate::error::{Error, Result};
use crate::protocol::frame;

/// Production [`ControlChannel`] over TLS.
pub struct TlsChannel {
    settings: ComSettings,
    stream: Option<StreamOwned<ClientConnection, TcpStream>>,
    rx_buf: BytesMut,
}

enum ReadOutcome {
    Drained,
    Eof,
    Failed(io::Error),
}

impl TlsChannel {
    pub fn new(settings: ComSettings) -> Self {
        Self {
            settings,
            stream: None,
            rx_buf: BytesMut::new(),
        }
    }

    fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        crate::daemon::pidfile::verify_file_perms(&self.settings.cert_file)?;
        crate::daemon::pidfile::verify_file_perms(&self.settings.key_file)?;

        let certs = load_certs(&self.settings.cert_file)?;
        let key = load_key(&self.settings.key_file)?;

        let provider = Arc::new(crypto_ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
            .map_err(|e| Error::Transport {
                message: format!("TLS protocol setup failed: {e}"),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptController { provider }))
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Transport {
                message: format!("failed to load client certificate/key: {e}"),
            })?;

        Ok(Arc::new(config))
    }

    fn resolve(&self) -> Result<SocketAddr> {
        (self.settings.ctrl_addr.as_str(), self.settings.ctrl_port)
            .to_socket_addrs()
            .map_err(|e| Error::Transport {
                message: format!("failed to resolve {}: {e}", self.settings.ctrl_addr),
            })?
            .next()
            .ok_or_else(|| Error::Transport {
                message: format!("no addresses for {}", self.settings.ctrl_addr),
            })
    }

    fn try_connect(
        &self,
        addr: SocketAddr,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<StreamOwned<ClientConnection, TcpStream>> {
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            Error::Transport {
                message: format!("TCP connect to {addr} failed: {e}"),
            }
        })?;
        tcp.set_read_timeout(Some(self.settings.read_timeout))?;
        tcp.set_write_timeout(Some(self.settings.write_timeout))?;
        let _ = tcp.set_nodelay(true);

        let server_name =
            ServerName::try_from(self.settings.ctrl_addr.clone()).map_err(|e| Error::Transport {
                message: format!("invalid controller name {:?}: {e}", self.settings.ctrl_addr),
            })?;
        let conn = ClientConnection::new(config, server_name).map_err(|e| Error::Transport {
            message: format!("TLS session setup failed: {e}"),
        })?;

        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| Error::Transport {
                    message: format!("TLS handshake with {addr} failed: {e}"),
                })?;
        }

        Ok(stream)
    }

    /// Pull whatever the socket has queued into the frame buffer without
    /// blocking.
    fn drain_socket(&mut self) -> Result<ReadOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnDown);
        };

        stream.sock.set_nonblocking(true)?;
        let mut chunk = [0u8; 4096];
        let outcome = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break ReadOutcome::Eof,
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break ReadOutcome::Eof,
                Err(e) => break ReadOutcome::Failed(e),
            }
        };
        let _ = stream.sock.set_nonblocking(false);

        Ok(outcome)
    }
}

impl ControlChannel for TlsChannel {
    fn connect(&mut self) -> Result<()> {
        if self.conn_state().is_connected() {
            return Ok(());
        }

        if self.settings.use_spa {
            let hmac_key =
                self.settings
                    .spa_hmac_key
                    .as_deref()
                    .ok_or_else(|| Error::Uninitialized {
                        message: "USE_SPA set without an SPA HMAC key".into(),
                    })?;
            spa::send_knock(&self.settings.ctrl_addr, hmac_key)?;
            thread::sleep(self.settings.post_spa_delay);
        }

        let config = self.tls_config()?;
        let addr = self.resolve()?;

        let mut last_err = None;
        for attempt in 1..=self.settings.max_conn_attempts.max(1) {
            if attempt > 1 {
                thread::sleep(self.settings.init_conn_retry_interval);
            }
            match self.try_connect(addr, config.clone()) {
                Ok(stream) => {
                    debug!(%addr, attempt, "connected to controller");
                    self.stream = Some(stream);
                    self.rx_buf.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!(%addr, attempt, error = %e, "connection attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(Error::Transport {
            message: "no connection attempts configured".into(),
        }))
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            let _ = stream.conn.complete_io(&mut stream.sock);
            debug!("disconnected from controller");
        }
        self.rx_buf.clear();
    }

    fn send_msg(&mut self, msg: &str) -> Result<()> {
        let encoded = frame::encode(msg)?;

        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnDown);
        };

        let written = stream.write_all(&encoded).and_then(|_| stream.flush());
        if let Err(e) = written {
            warn!(error = %e, "send failed, dropping session");
            self.disconnect();
            return Err(Error::Transport {
                message: format!("send failed: {e}"),
            });
        }

        Ok(())
    }

    fn get_msg(&mut self) -> Result<Option<String>> {
        if self.stream.is_none() {
            return Err(Error::ConnDown);
        }

        // A frame may already be buffered from the previous poll.
        if let Some(text) = frame::decode(&mut self.rx_buf)? {
            return Ok(Some(text));
        }

        match self.drain_socket()? {
            ReadOutcome::Drained => {}
            ReadOutcome::Eof => {
                warn!("controller closed the connection");
                self.disconnect();
                return Ok(None);
            }
            ReadOutcome::Failed(e) => {
                self.disconnect();
                return Err(Error::Transport {
                    message: format!("receive failed: {e}"),
                });
            }
        }

        frame::decode(&mut self.rx_buf)
    }

    fn conn_state(&self) -> ConnState {
        if self.stream.is_some() {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        }
    }

    fn set_spa_keys(&mut self, encryption_key: &str, hmac_key: &str) -> Result<()> {
        if encryption_key.len() > MAX_B64_KEY_LEN || hmac_key.len() > MAX_B64_KEY_LEN {
            return Err(Error::Config {
                message: format!("SPA key exceeds {MAX_B64_KEY_LEN} characters"),
            });
        }
        self.settings.spa_encryption_key = Some(encryption_key.to_string());
        self.settings.spa_hmac_key = Some(hmac_key.to_string());
        Ok(())
    }

    fn reconfigure(&mut self, settings: ComSettings) -> Result<()> {
        self.disconnect();
        self.settings = settings;
        self.rx_buf = BytesMut::new();
        Ok(())
    }
}

/// Accepts the controller certificate without chain verification while
/// still checking handshake signatures.
#[derive(Debug)]
struct AcceptController {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptController {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Load the certificate chain from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| Error::Filesystem {
        path: path.display().to_string(),
        message: format!("failed to read certificate: {e}"),
    })?;

    let mut reader = io::BufReader::new(&pem[..]);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to parse certificate: {e}"),
        })?;

    if certs.is_empty() {
        return Err(Error::Filesystem {
            path: path.display().to_string(),
            message: "no certificates found in PEM file".into(),
        });
    }

    Ok(certs)
}

/// Load the private key from a PEM file.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| Error::Filesystem {
        path: path.display().to_string(),
        message: format!("failed to read key: {e}"),
    })?;

    let mut reader = io::BufReader::new(&pem[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to parse key: {e}"),
        })?
        .ok_or_else(|| Error::Filesystem {
            path: path.display().to_string(),
            message: "no private key found in PEM file".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn settings() -> ComSettings {
        ComSettings {
            ctrl_addr: "127.0.0.1".into(),
            ctrl_port: 1, // nothing listens here
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
            use_spa: false,
            spa_encryption_key: None,
            spa_hmac_key: None,
            post_spa_delay: Duration::ZERO,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
            max_conn_attempts: 1,
            init_conn_retry_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn starts_disconnected() {
        let chan = TlsChannel::new(settings());
        assert_eq!(chan.conn_state(), ConnState::Disconnected);
    }

    #[test]
    fn send_while_disconnected_is_conn_down() {
        let mut chan = TlsChannel::new(settings());
        assert!(matches!(
            chan.send_msg(r#"{"subject":"keep_alive"}"#),
            Err(Error::ConnDown)
        ));
    }

    #[test]
    fn get_while_disconnected_is_conn_down() {
        let mut chan = TlsChannel::new(settings());
        assert!(matches!(chan.get_msg(), Err(Error::ConnDown)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut chan = TlsChannel::new(settings());
        chan.disconnect();
        chan.disconnect();
        assert_eq!(chan.conn_state(), ConnState::Disconnected);
    }

    #[test]
    fn connect_without_cert_fails_with_filesystem_error() {
        let mut chan = TlsChannel::new(settings());
        assert!(matches!(chan.connect(), Err(Error::Filesystem { .. })));
    }

    #[test]
    fn set_spa_keys_rejects_oversized() {
        let mut chan = TlsChannel::new(settings());
        let big = "k".repeat(MAX_B64_KEY_LEN + 1);
        assert!(chan.set_spa_keys(&big, "ok").is_err());
        assert!(chan.set_spa_keys("enc", "hmac").is_ok());
    }

    #[test]
    fn reconfigure_adopts_new_settings() {
        let mut chan = TlsChannel::new(settings());
        let mut new_settings = settings();
        new_settings.ctrl_addr = "10.0.0.9".into();
        chan.reconfigure(new_settings).unwrap();
        assert_eq!(chan.settings.ctrl_addr, "10.0.0.9");
        assert_eq!(chan.conn_state(), ConnState::Disconnected);
    }

    #[test]
    fn load_certs_parses_pem() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(f, "AAECAwQFBgcICQ==").unwrap();
        writeln!(f, "-----END CERTIFICATE-----").unwrap();
        f.flush().unwrap();

        let certs = load_certs(f.path()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn load_certs_empty_file_is_error() {
        let f = NamedTempFile::new().unwrap();
        assert!(load_certs(f.path()).is_err());
    }

    #[test]
    fn load_key_missing_file_is_error() {
        assert!(matches!(
            load_key(Path::new("/nonexistent/key.pem")),
            Err(Error::Filesystem { .. })
        ));
    }
}
