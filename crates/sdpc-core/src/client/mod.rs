//! The control client: context, request paths, and the run loop.
//!
//! A [`Client`] owns everything for the process lifetime: the policy
//! timers, the state machine, the transport facade, and (when it is the
//! single running instance) the PID-file lock. The loop is
//! single-threaded and cooperative; it blocks only in the transport and
//! its own one-tick sleep.

mod state;
#[cfg(test)]
mod test_mock_channel;

pub use state::ClientState;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::com::{ComSettings, ControlChannel};
use crate::config::ClientConfig;
use crate::constants::LOOP_TICK;
use crate::creds::{self, CredFilePaths};
use crate::daemon::pidfile::PidFileLock;
use crate::daemon::signals;
use crate::error::{Error, Result};
use crate::protocol::{self, CredentialBundle, InboundResult, Stage, Subject};

/// Loop policy timers, split out so tests can compress them.
#[derive(Debug, Clone)]
pub struct Policy {
    pub keep_alive_interval: Duration,
    pub cred_update_interval: Duration,
    pub access_update_interval: Duration,
    pub init_req_retry_interval: Duration,
    pub max_req_attempts: u32,
    pub msg_q_len: u32,
    /// Outer loop sleep; one second in production.
    pub tick: Duration,
}

impl Policy {
    fn from_config(config: &ClientConfig) -> Self {
        Self {
            keep_alive_interval: config.keep_alive_interval,
            cred_update_interval: config.cred_update_interval,
            access_update_interval: config.access_update_interval,
            init_req_retry_interval: config.init_req_retry_interval,
            max_req_attempts: config.max_req_attempts,
            msg_q_len: config.msg_q_len,
            tick: LOOP_TICK,
        }
    }
}

/// The long-lived control client context.
pub struct Client<C: ControlChannel> {
    config_file: PathBuf,
    fwknoprc_file: PathBuf,
    pid_file: PathBuf,
    ctrl_addr: String,
    ctrl_port: u16,
    remain_connected: bool,
    foreground: bool,
    cred_paths: CredFilePaths,
    policy: Policy,

    state: ClientState,
    last_contact: Option<Instant>,
    last_cred_update: Option<Instant>,
    #[cfg_attr(not(feature = "gateway"), allow(dead_code))]
    last_access_update: Option<Instant>,
    initial_conn_time: Option<Instant>,
    last_req_time: Option<Instant>,
    req_retry_interval: Duration,
    req_attempts: u32,

    com: C,
    pid_lock: Option<PidFileLock>,
}

impl<C: ControlChannel> Client<C> {
    /// Build a client context from a loaded configuration and a
    /// transport facade.
    pub fn new(config: &ClientConfig, com: C) -> Self {
        let mut client = Self {
            config_file: PathBuf::new(),
            fwknoprc_file: PathBuf::new(),
            pid_file: PathBuf::new(),
            ctrl_addr: String::new(),
            ctrl_port: 0,
            remain_connected: false,
            foreground: true,
            cred_paths: CredFilePaths {
                cert_file: PathBuf::new(),
                key_file: PathBuf::new(),
                config_file: PathBuf::new(),
                fwknoprc_file: PathBuf::new(),
                ctrl_stanza: String::new(),
            },
            policy: Policy::from_config(config),
            state: ClientState::Ready,
            last_contact: None,
            last_cred_update: None,
            last_access_update: None,
            initial_conn_time: None,
            last_req_time: None,
            req_retry_interval: config.init_req_retry_interval,
            req_attempts: 0,
            com,
            pid_lock: None,
        };
        client.adopt_config(config);
        client
    }

    /// Hand over the single-instance lock; held until the process exits.
    pub fn attach_pid_lock(&mut self, lock: PidFileLock) {
        self.pid_lock = Some(lock);
    }

    pub fn pid_lock(&self) -> Option<&PidFileLock> {
        self.pid_lock.as_ref()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn req_attempts(&self) -> u32 {
        self.req_attempts
    }

    pub fn req_retry_interval(&self) -> Duration {
        self.req_retry_interval
    }

    pub fn last_cred_update(&self) -> Option<Instant> {
        self.last_cred_update
    }

    pub fn controller_addr(&self) -> &str {
        &self.ctrl_addr
    }

    pub fn controller_port(&self) -> u16 {
        self.ctrl_port
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut Policy {
        &mut self.policy
    }

    pub fn channel(&self) -> &C {
        &self.com
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.com
    }

    /// Establish the controller session.
    pub fn connect(&mut self) -> Result<()> {
        self.com.connect()
    }

    /// Tear the controller session down. Idempotent.
    pub fn disconnect(&mut self) {
        self.com.disconnect();
    }

    /// Run the control loop until exit.
    ///
    /// Returns `Ok(())` for the configured clean exits (one-shot refresh
    /// complete); otherwise the terminal error, including
    /// [`Error::GotExitSig`] for INT/TERM.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_loop();

        self.com.disconnect();
        match &result {
            Ok(()) => info!("SDP control client exiting"),
            Err(Error::GotExitSig) => info!("SDP control client exiting on signal"),
            Err(e) => error!(error = %e, "SDP control client exiting"),
        }

        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            // (1) reconnect if necessary
            if !self.com.conn_state().is_connected() {
                self.com.connect()?;
                let now = Instant::now();
                self.initial_conn_time = Some(now);
                self.last_contact = Some(now);
                // A fresh connection starts a fresh request cycle; the
                // prior cycle's attempts are not charged to it.
                self.clear_request_vars();
                info!(
                    controller = %self.ctrl_addr,
                    port = self.ctrl_port,
                    "session established"
                );
            }

            // (2) drain and dispatch inbound messages
            self.check_inbox()?;

            // (3) credential refresh
            self.consider_cred_update()?;

            // (4) access refresh, gateway builds only
            #[cfg(feature = "gateway")]
            self.consider_access_update()?;

            // (5) one-shot mode exits once credentials have landed
            if !self.remain_connected && self.last_cred_update.is_some() {
                info!("credential update complete; exiting as configured");
                return Ok(());
            }

            // (6) pending signals
            self.handle_signals()?;

            // (7) keep-alive
            self.consider_keep_alive()?;

            // (8) idle
            thread::sleep(self.policy.tick);
        }
    }

    /// Drain up to `msg_q_len` inbound envelopes and dispatch them.
    fn check_inbox(&mut self) -> Result<()> {
        for _ in 0..self.policy.msg_q_len {
            let Some(msg) = self.com.get_msg()? else {
                break;
            };

            match protocol::process(&msg)? {
                InboundResult::KeepAliveFulfilling => {
                    info!("keep-alive response received");
                    self.process_keep_alive();
                }
                InboundResult::CredsFulfilling(bundle) => {
                    info!("credential update received");
                    if let Err(e) = self.process_cred_update(*bundle) {
                        if e.counts_as_failed_request() {
                            // The outstanding request stays open; the
                            // retry path and attempt cap govern recovery.
                            warn!(error = %e, "failed to process credential update");
                        } else {
                            return Err(e);
                        }
                    }
                }
                InboundResult::BadResult => {
                    error!("unknown message processing result");
                }
            }
        }
        Ok(())
    }

    /// Transmit a keep-alive probe.
    ///
    /// Callable only while connected and in `Ready` or a keep-alive
    /// cycle; other states refuse without sending.
    pub fn request_keep_alive(&mut self) -> Result<()> {
        if !self.com.conn_state().is_connected() {
            return Err(Error::ConnDown);
        }
        if !self.state.allows_keep_alive() {
            debug!(state = self.state.name(), "not in a state to request keep-alive");
            return Err(Error::State {
                operation: "keep_alive",
                state: self.state.name().into(),
            });
        }

        let msg = protocol::make(Subject::KeepAlive, None)?;
        let sent = self.com.send_msg(&msg);

        // The transmission counts against the attempt cap even when the
        // wire rejected it.
        self.mark_request_sent(ClientState::KeepAliveRequesting);

        sent.map_err(|e| {
            error!(error = %e, "failed to send keep-alive request");
            Error::KeepAlive {
                message: e.to_string(),
            }
        })
    }

    /// Transmit a credential update request.
    pub fn request_cred_update(&mut self) -> Result<()> {
        if !self.com.conn_state().is_connected() {
            return Err(Error::ConnDown);
        }
        if !self.state.allows_cred_request() {
            debug!(
                state = self.state.name(),
                "not in a state to request credential update"
            );
            return Err(Error::State {
                operation: "cred_update",
                state: self.state.name().into(),
            });
        }

        let msg = protocol::make(Subject::CredUpdate, Some(Stage::Requesting))?;
        let sent = self.com.send_msg(&msg);

        self.mark_request_sent(ClientState::CredRequesting);

        sent.map_err(|e| {
            error!(error = %e, "failed to send credential request");
            Error::CredReq {
                message: e.to_string(),
            }
        })
    }

    fn process_keep_alive(&mut self) {
        self.last_contact = Some(Instant::now());
        if self.state.in_keep_alive_cycle() {
            self.clear_request_vars();
        }
    }

    /// Store a delivered bundle, acknowledge it, and stamp the update.
    ///
    /// `last_cred_update` moves only after the bundle is both applied
    /// and acknowledged.
    fn process_cred_update(&mut self, bundle: CredentialBundle) -> Result<()> {
        creds::apply(&self.cred_paths, &bundle, &mut self.com)?;

        let ack = protocol::make(Subject::CredUpdate, Some(Stage::Fulfilled))?;
        self.com.send_msg(&ack).map_err(|e| {
            error!(error = %e, "failed to send credential fulfilled message");
            Error::CredReq {
                message: e.to_string(),
            }
        })?;

        let now = Instant::now();
        self.last_contact = Some(now);
        self.last_cred_update = Some(now);
        if self.state.in_cred_cycle() {
            self.clear_request_vars();
        }
        Ok(())
    }

    /// Send a keep-alive when due; drive the retry cycle when one is
    /// outstanding.
    fn consider_keep_alive(&mut self) -> Result<()> {
        if !self.com.conn_state().is_connected() {
            return Ok(());
        }

        match self.state {
            ClientState::Ready => {
                let due = self
                    .last_contact
                    .map_or(true, |t| t.elapsed() >= self.policy.keep_alive_interval);
                if due {
                    self.dispatch_request(Self::request_keep_alive)
                } else {
                    Ok(())
                }
            }
            ClientState::KeepAliveRequesting | ClientState::KeepAliveUnfulfilled => {
                if !self.retry_due() {
                    return Ok(());
                }
                if self.req_attempts >= self.policy.max_req_attempts {
                    error!("too many failed keep-alive requests; exiting");
                    return self.give_up();
                }
                self.state = ClientState::KeepAliveUnfulfilled;
                self.req_retry_interval = self.req_retry_interval.saturating_mul(2);
                debug!("retrying unfulfilled keep-alive request");
                self.dispatch_request(Self::request_keep_alive)
            }
            _ => Ok(()),
        }
    }

    /// Request a credential update when due; drive the retry cycle when
    /// one is outstanding.
    fn consider_cred_update(&mut self) -> Result<()> {
        if !self.com.conn_state().is_connected() {
            return Ok(());
        }

        match self.state {
            ClientState::Ready => {
                let due = self
                    .last_cred_update
                    .map_or(true, |t| t.elapsed() >= self.policy.cred_update_interval);
                if due {
                    debug!("credential update due");
                    self.dispatch_request(Self::request_cred_update)
                } else {
                    Ok(())
                }
            }
            ClientState::CredRequesting | ClientState::CredUnfulfilled => {
                if !self.retry_due() {
                    return Ok(());
                }
                if self.req_attempts >= self.policy.max_req_attempts {
                    error!("too many failed credential requests; exiting");
                    return self.give_up();
                }
                self.state = ClientState::CredUnfulfilled;
                self.req_retry_interval = self.req_retry_interval.saturating_mul(2);
                debug!("retrying unfulfilled credential update request");
                self.dispatch_request(Self::request_cred_update)
            }
            _ => Ok(()),
        }
    }

    /// Fire off an access refresh when due. Gateways receive the policy
    /// payload through the regular inbox path.
    #[cfg(feature = "gateway")]
    fn consider_access_update(&mut self) -> Result<()> {
        if !self.com.conn_state().is_connected() || self.state != ClientState::Ready {
            return Ok(());
        }

        let due = self
            .last_access_update
            .map_or(true, |t| t.elapsed() >= self.policy.access_update_interval);
        if !due {
            return Ok(());
        }

        debug!("access update due");
        let msg = protocol::make(Subject::AccessUpdate, Some(Stage::Requesting))?;
        self.com.send_msg(&msg).map_err(|e| Error::Transport {
            message: format!("failed to send access request: {e}"),
        })?;
        self.last_access_update = Some(Instant::now());
        Ok(())
    }

    /// Run one request transmission, absorbing failures that the retry
    /// cycle owns.
    fn dispatch_request(&mut self, request: fn(&mut Self) -> Result<()>) -> Result<()> {
        match request(self) {
            Ok(()) => Ok(()),
            Err(e) if e.counts_as_failed_request() => {
                warn!(error = %e, "request transmission failed; retry cycle continues");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn retry_due(&self) -> bool {
        self.last_req_time
            .map_or(true, |t| t.elapsed() >= self.req_retry_interval)
    }

    fn give_up(&mut self) -> Result<()> {
        self.com.disconnect();
        self.state = ClientState::TimeToQuit;
        Err(Error::ManyFailedReqs)
    }

    /// Handle any signals the OS delivered since the last iteration.
    fn handle_signals(&mut self) -> Result<()> {
        let Some(pending) = signals::take() else {
            return Ok(());
        };

        if pending.hup {
            warn!("got SIGHUP, restarting");
            // A reinit failure surfaces and ends the loop; success lets
            // it carry on with the fresh context.
            return self.reinit();
        }
        if pending.int {
            warn!("got SIGINT, exiting");
            return Err(Error::GotExitSig);
        }
        if pending.term {
            warn!("got SIGTERM, exiting");
            return Err(Error::GotExitSig);
        }
        if pending.usr1 {
            debug!("got SIGUSR1; no action defined");
        }
        if pending.usr2 {
            debug!("got SIGUSR2; no action defined");
        }
        if pending.chld {
            debug!("reaped child process");
        }
        Ok(())
    }

    /// Re-initialize in place after SIGHUP: disconnect, re-read the
    /// config file, rebuild every field through the same owning slot.
    /// The PID-file lock is the one thing that survives untouched.
    pub fn reinit(&mut self) -> Result<()> {
        self.com.disconnect();

        let config = ClientConfig::load(&self.config_file, &self.fwknoprc_file)?;
        let settings = ComSettings::from_config(&config);

        self.adopt_config(&config);
        self.com.reconfigure(settings)?;

        self.describe();
        Ok(())
    }

    /// Install `config` and reset all runtime state. Preserves the PID
    /// lock and the loop tick (the latter is not a config option).
    fn adopt_config(&mut self, config: &ClientConfig) {
        let tick = self.policy.tick;

        self.config_file = config.config_file.clone();
        self.fwknoprc_file = config.fwknoprc_file.clone();
        self.pid_file = config.pid_file.clone();
        self.ctrl_addr = config.ctrl_addr.clone();
        self.ctrl_port = config.ctrl_port;
        self.remain_connected = config.remain_connected;
        self.foreground = config.foreground;
        self.cred_paths = CredFilePaths {
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            config_file: config.config_file.clone(),
            fwknoprc_file: config.fwknoprc_file.clone(),
            ctrl_stanza: config.ctrl_stanza.clone(),
        };
        self.policy = Policy::from_config(config);
        self.policy.tick = tick;

        self.state = ClientState::Ready;
        self.last_contact = None;
        self.last_cred_update = None;
        self.last_access_update = None;
        self.initial_conn_time = None;
        self.clear_request_vars();
    }

    fn clear_request_vars(&mut self) {
        self.last_req_time = None;
        self.req_retry_interval = self.policy.init_req_retry_interval;
        self.req_attempts = 0;
        if self.state != ClientState::TimeToQuit {
            self.state = ClientState::Ready;
        }
    }

    fn mark_request_sent(&mut self, new_state: ClientState) {
        self.state = new_state;
        self.last_req_time = Some(Instant::now());
        self.req_attempts += 1;
    }

    /// Dump the context at debug level.
    pub fn describe(&self) {
        debug!(
            config_file = %self.config_file.display(),
            fwknoprc_file = %self.fwknoprc_file.display(),
            controller = format_args!("{}:{}", self.ctrl_addr, self.ctrl_port),
            connected = self.com.conn_state().is_connected(),
            session_uptime = ?self.initial_conn_time.map(|t| t.elapsed()),
            state = self.state.name(),
            remain_connected = self.remain_connected,
            foreground = self.foreground,
            keep_alive_interval = ?self.policy.keep_alive_interval,
            cred_update_interval = ?self.policy.cred_update_interval,
            max_req_attempts = self.policy.max_req_attempts,
            req_attempts = self.req_attempts,
            pid_file = %self.pid_file.display(),
            pid_locked = self.pid_lock.is_some(),
            "control client context"
        );
    }
}
