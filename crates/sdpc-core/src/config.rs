//! Control client configuration.
//!
//! The config file is a flat `KEY value` format: one option per line,
//! `#` or `;` starts a comment, blank lines are ignored. Keys the client
//! does not recognize are warned about and skipped so a config shared
//! with other SDP tooling still loads.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::constants::{
    DEFAULT_ACCESS_UPDATE_INTERVAL, DEFAULT_CRED_UPDATE_INTERVAL, DEFAULT_CTRL_PORT,
    DEFAULT_CTRL_STANZA, DEFAULT_INIT_CONN_RETRY_INTERVAL, DEFAULT_INIT_REQUEST_RETRY_INTERVAL,
    DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_MAX_CONN_ATTEMPTS, DEFAULT_MAX_REQUEST_ATTEMPTS,
    DEFAULT_MSG_Q_LEN, DEFAULT_PID_FILE, DEFAULT_POST_SPA_DELAY, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, MAX_B64_KEY_LEN, MAX_LINE_LEN, MAX_MSG_Q_LEN, MAX_POST_SPA_DELAY,
    MAX_SERVER_STR_LEN,
};
use crate::error::{Error, Result};

/// Parsed client configuration with every recognized option resolved to
/// its value or default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path this config was loaded from (re-read on SIGHUP).
    pub config_file: PathBuf,
    /// Path to the fwknop rc file carrying the SPA key stanzas.
    pub fwknoprc_file: PathBuf,

    pub ctrl_addr: String,
    pub ctrl_port: u16,
    pub ctrl_stanza: String,

    pub use_spa: bool,
    pub remain_connected: bool,
    pub foreground: bool,
    pub use_syslog: bool,
    pub verbosity: u8,

    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub spa_encryption_key: Option<String>,
    pub spa_hmac_key: Option<String>,

    pub msg_q_len: u32,
    pub post_spa_delay: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub cred_update_interval: Duration,
    pub access_update_interval: Duration,
    pub max_conn_attempts: u32,
    pub init_conn_retry_interval: Duration,
    pub keep_alive_interval: Duration,
    pub max_req_attempts: u32,
    pub init_req_retry_interval: Duration,

    pub pid_file: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Load and validate a configuration from `config_file`.
    ///
    /// `fwknoprc_file` is not parsed here; the credential store rewrites
    /// its SPA key stanzas in place, so only the path is recorded.
    pub fn load(config_file: &Path, fwknoprc_file: &Path) -> Result<Self> {
        let text = fs::read_to_string(config_file).map_err(|e| Error::Filesystem {
            path: config_file.display().to_string(),
            message: e.to_string(),
        })?;

        let mut cfg = RawConfig::default();

        for (lineno, line) in text.lines().enumerate() {
            if line.len() > MAX_LINE_LEN {
                return Err(Error::Config {
                    message: format!(
                        "{}:{}: line exceeds {} bytes",
                        config_file.display(),
                        lineno + 1,
                        MAX_LINE_LEN
                    ),
                });
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let (key, val) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => {
                    return Err(Error::Config {
                        message: format!(
                            "{}:{}: expected 'KEY value', got {:?}",
                            config_file.display(),
                            lineno + 1,
                            line
                        ),
                    });
                }
            };

            cfg.apply(key, val, lineno + 1)?;
        }

        cfg.finish(config_file, fwknoprc_file)
    }
}

/// Accumulator for options seen while parsing; `finish` applies defaults
/// and the cross-option checks.
#[derive(Debug, Default)]
struct RawConfig {
    ctrl_addr: Option<String>,
    ctrl_port: Option<u16>,
    ctrl_stanza: Option<String>,
    use_spa: Option<bool>,
    remain_connected: Option<bool>,
    foreground: Option<bool>,
    use_syslog: Option<bool>,
    verbosity: Option<u8>,
    key_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    spa_encryption_key: Option<String>,
    spa_hmac_key: Option<String>,
    msg_q_len: Option<u32>,
    post_spa_delay: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    cred_update_interval: Option<Duration>,
    access_update_interval: Option<Duration>,
    max_conn_attempts: Option<u32>,
    init_conn_retry_interval: Option<Duration>,
    keep_alive_interval: Option<Duration>,
    max_req_attempts: Option<u32>,
    init_req_retry_interval: Option<Duration>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl RawConfig {
    fn apply(&mut self, key: &str, val: &str, lineno: usize) -> Result<()> {
        match key {
            "CTRL_ADDR" => {
                if val.len() > MAX_SERVER_STR_LEN {
                    return Err(Error::Config {
                        message: format!(
                            "line {lineno}: CTRL_ADDR exceeds {MAX_SERVER_STR_LEN} characters"
                        ),
                    });
                }
                self.ctrl_addr = Some(val.to_string());
            }
            "CTRL_PORT" => self.ctrl_port = Some(parse_num(key, val, lineno)?),
            "CTRL_STANZA" => self.ctrl_stanza = Some(val.to_string()),
            "USE_SPA" => self.use_spa = Some(parse_bool(key, val, lineno)?),
            "REMAIN_CONNECTED" => self.remain_connected = Some(parse_bool(key, val, lineno)?),
            "FOREGROUND" => self.foreground = Some(parse_bool(key, val, lineno)?),
            "USE_SYSLOG" => self.use_syslog = Some(parse_bool(key, val, lineno)?),
            "VERBOSITY" => self.verbosity = Some(parse_num(key, val, lineno)?),
            "KEY_FILE" => self.key_file = Some(PathBuf::from(val)),
            "CERT_FILE" => self.cert_file = Some(PathBuf::from(val)),
            "SPA_ENCRYPTION_KEY" => {
                self.spa_encryption_key = Some(parse_key(key, val, lineno)?);
            }
            "SPA_HMAC_KEY" => self.spa_hmac_key = Some(parse_key(key, val, lineno)?),
            "MSG_Q_LEN" => {
                let len: u32 = parse_num(key, val, lineno)?;
                if len > MAX_MSG_Q_LEN {
                    warn!(len, cap = MAX_MSG_Q_LEN, "MSG_Q_LEN capped");
                }
                self.msg_q_len = Some(len.min(MAX_MSG_Q_LEN));
            }
            "POST_SPA_DELAY" => {
                let secs: f64 = val.parse().map_err(|_| Error::Config {
                    message: format!("line {lineno}: POST_SPA_DELAY is not a number: {val:?}"),
                })?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(Error::Config {
                        message: format!("line {lineno}: POST_SPA_DELAY out of range: {val:?}"),
                    });
                }
                let delay = Duration::from_secs_f64(secs);
                if delay > MAX_POST_SPA_DELAY {
                    warn!(?delay, cap = ?MAX_POST_SPA_DELAY, "POST_SPA_DELAY capped");
                }
                self.post_spa_delay = Some(delay.min(MAX_POST_SPA_DELAY));
            }
            "READ_TIMEOUT" => self.read_timeout = Some(parse_secs(key, val, lineno)?),
            "WRITE_TIMEOUT" => self.write_timeout = Some(parse_secs(key, val, lineno)?),
            "CRED_UPDATE_INTERVAL" => {
                self.cred_update_interval = Some(parse_secs(key, val, lineno)?);
            }
            "ACCESS_UPDATE_INTERVAL" => {
                self.access_update_interval = Some(parse_secs(key, val, lineno)?);
            }
            "MAX_CONN_ATTEMPTS" => self.max_conn_attempts = Some(parse_num(key, val, lineno)?),
            "INIT_CONN_RETRY_INTERVAL" => {
                self.init_conn_retry_interval = Some(parse_secs(key, val, lineno)?);
            }
            "KEEP_ALIVE_INTERVAL" => self.keep_alive_interval = Some(parse_secs(key, val, lineno)?),
            "MAX_REQUEST_ATTEMPTS" => self.max_req_attempts = Some(parse_num(key, val, lineno)?),
            "INIT_REQUEST_RETRY_INTERVAL" => {
                self.init_req_retry_interval = Some(parse_secs(key, val, lineno)?);
            }
            "PID_FILE" => self.pid_file = Some(PathBuf::from(val)),
            "LOG_FILE" => self.log_file = Some(PathBuf::from(val)),
            _ => warn!(key, lineno, "unrecognized config option ignored"),
        }
        Ok(())
    }

    fn finish(self, config_file: &Path, fwknoprc_file: &Path) -> Result<ClientConfig> {
        let ctrl_addr = self.ctrl_addr.ok_or_else(|| Error::Config {
            message: "CTRL_ADDR is required".into(),
        })?;
        let key_file = self.key_file.ok_or_else(|| Error::Config {
            message: "KEY_FILE is required".into(),
        })?;
        let cert_file = self.cert_file.ok_or_else(|| Error::Config {
            message: "CERT_FILE is required".into(),
        })?;

        let use_spa = self.use_spa.unwrap_or(false);
        if use_spa && (self.spa_encryption_key.is_none() || self.spa_hmac_key.is_none()) {
            return Err(Error::Config {
                message: "USE_SPA requires SPA_ENCRYPTION_KEY and SPA_HMAC_KEY".into(),
            });
        }

        Ok(ClientConfig {
            config_file: config_file.to_path_buf(),
            fwknoprc_file: fwknoprc_file.to_path_buf(),
            ctrl_addr,
            ctrl_port: self.ctrl_port.unwrap_or(DEFAULT_CTRL_PORT),
            ctrl_stanza: self.ctrl_stanza.unwrap_or_else(|| DEFAULT_CTRL_STANZA.into()),
            use_spa,
            remain_connected: self.remain_connected.unwrap_or(false),
            foreground: self.foreground.unwrap_or(true),
            use_syslog: self.use_syslog.unwrap_or(false),
            verbosity: self.verbosity.unwrap_or(1),
            key_file,
            cert_file,
            spa_encryption_key: self.spa_encryption_key,
            spa_hmac_key: self.spa_hmac_key,
            msg_q_len: self.msg_q_len.unwrap_or(DEFAULT_MSG_Q_LEN),
            post_spa_delay: self.post_spa_delay.unwrap_or(DEFAULT_POST_SPA_DELAY),
            read_timeout: self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT),
            cred_update_interval: self
                .cred_update_interval
                .unwrap_or(DEFAULT_CRED_UPDATE_INTERVAL),
            access_update_interval: self
                .access_update_interval
                .unwrap_or(DEFAULT_ACCESS_UPDATE_INTERVAL),
            max_conn_attempts: self.max_conn_attempts.unwrap_or(DEFAULT_MAX_CONN_ATTEMPTS),
            init_conn_retry_interval: self
                .init_conn_retry_interval
                .unwrap_or(DEFAULT_INIT_CONN_RETRY_INTERVAL),
            keep_alive_interval: self.keep_alive_interval.unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL),
            max_req_attempts: self.max_req_attempts.unwrap_or(DEFAULT_MAX_REQUEST_ATTEMPTS),
            init_req_retry_interval: self
                .init_req_retry_interval
                .unwrap_or(DEFAULT_INIT_REQUEST_RETRY_INTERVAL),
            pid_file: self.pid_file.unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
            log_file: self.log_file,
        })
    }
}

fn parse_bool(key: &str, val: &str, lineno: usize) -> Result<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" => Ok(true),
        "0" | "n" | "no" | "false" => Ok(false),
        _ => Err(Error::Config {
            message: format!("line {lineno}: {key} expects a boolean, got {val:?}"),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, val: &str, lineno: usize) -> Result<T> {
    val.parse().map_err(|_| Error::Config {
        message: format!("line {lineno}: {key} is not a valid number: {val:?}"),
    })
}

fn parse_secs(key: &str, val: &str, lineno: usize) -> Result<Duration> {
    let secs: u64 = parse_num(key, val, lineno)?;
    Ok(Duration::from_secs(secs))
}

fn parse_key(key: &str, val: &str, lineno: usize) -> Result<String> {
    if val.len() > MAX_B64_KEY_LEN {
        return Err(Error::Config {
            message: format!("line {lineno}: {key} exceeds {MAX_B64_KEY_LEN} characters"),
        });
    }
    Ok(val.to_string())
}
