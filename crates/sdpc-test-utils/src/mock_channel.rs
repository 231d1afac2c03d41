//! Scripted controller transport.
//!
//! Implements [`ControlChannel`] over in-memory queues. Tests script the
//! controller side: auto-reply to keep-alives, deliver a credential
//! bundle on request, stay silent, or fail the channel after a number of
//! delivered messages to break a test loop out.

use std::collections::VecDeque;
use std::time::Instant;

use sdpc_core::com::{ComSettings, ConnState, ControlChannel};
use sdpc_core::error::{Error, Result};
use sdpc_core::protocol::CredentialBundle;

/// In-memory [`ControlChannel`] with a scriptable controller.
#[derive(Debug, Default)]
pub struct MockChannel {
    state: ConnState,
    inbox: VecDeque<String>,
    sent: Vec<(Instant, String)>,
    spa_keys: Option<(String, String)>,

    answer_keep_alives: bool,
    cred_reply: Option<CredentialBundle>,
    fail_get_after: Option<usize>,
    fail_next_connect: bool,

    delivered: usize,
    connect_count: usize,
    reconfigure_count: usize,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    // === scripting ===

    /// Answer every keep-alive probe with a fulfilling reply.
    pub fn answer_keep_alives(mut self) -> Self {
        self.answer_keep_alives = true;
        self
    }

    /// Answer the next credential requests with `bundle`.
    pub fn answer_cred_requests(mut self, bundle: CredentialBundle) -> Self {
        self.cred_reply = Some(bundle);
        self
    }

    /// Fail `get_msg` with a transport error once `n` messages have been
    /// delivered. Used to break `run()` out of an otherwise happy loop.
    pub fn fail_get_after(mut self, n: usize) -> Self {
        self.fail_get_after = Some(n);
        self
    }

    /// Make the next `connect` call fail.
    pub fn fail_next_connect(mut self) -> Self {
        self.fail_next_connect = true;
        self
    }

    // === inspection ===

    pub fn connected(&self) -> bool {
        self.state.is_connected()
    }

    /// All sent envelope texts, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.iter().map(|(_, text)| text.clone()).collect()
    }

    /// Send instants, for cadence and backoff timing assertions.
    pub fn send_times(&self) -> Vec<Instant> {
        self.sent.iter().map(|(at, _)| *at).collect()
    }

    /// Sent envelopes matching `subject` (and `stage` when given).
    pub fn sent_with_subject(&self, subject: &str, stage: Option<&str>) -> Vec<String> {
        self.sent
            .iter()
            .filter(|(_, text)| {
                let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
                    return false;
                };
                v["subject"] == subject
                    && stage.map_or(true, |s| v["stage"] == s)
            })
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn queued_inbound(&self) -> usize {
        self.inbox.len()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count
    }

    pub fn reconfigure_count(&self) -> usize {
        self.reconfigure_count
    }

    pub fn spa_keys(&self) -> Option<(String, String)> {
        self.spa_keys.clone()
    }

    // === manipulation ===

    /// Queue an inbound envelope from the controller.
    pub fn push_inbound(&mut self, text: &str) {
        self.inbox.push_back(text.to_string());
    }

    /// Mark the channel connected without a `connect` call.
    pub fn force_connected(&mut self) {
        self.state = ConnState::Connected;
    }

    /// React to an outbound envelope the way the script says.
    fn auto_reply(&mut self, msg: &str) {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(msg) else {
            return;
        };

        match (v["subject"].as_str(), v["stage"].as_str()) {
            (Some("keep_alive"), None) if self.answer_keep_alives => {
                self.inbox
                    .push_back(r#"{"subject":"keep_alive","stage":"fulfilling"}"#.to_string());
            }
            (Some("cred_update"), Some("requesting")) => {
                if let Some(bundle) = &self.cred_reply {
                    let reply = serde_json::json!({
                        "subject": "cred_update",
                        "stage": "fulfilling",
                        "data": bundle,
                    });
                    self.inbox.push_back(reply.to_string());
                }
            }
            _ => {}
        }
    }
}

impl ControlChannel for MockChannel {
    fn connect(&mut self) -> Result<()> {
        self.connect_count += 1;
        if self.fail_next_connect {
            self.fail_next_connect = false;
            return Err(Error::Transport {
                message: "scripted connect failure".into(),
            });
        }
        self.state = ConnState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state = ConnState::Disconnected;
    }

    fn send_msg(&mut self, msg: &str) -> Result<()> {
        if !self.state.is_connected() {
            return Err(Error::ConnDown);
        }
        self.sent.push((Instant::now(), msg.to_string()));
        self.auto_reply(msg);
        Ok(())
    }

    fn get_msg(&mut self) -> Result<Option<String>> {
        if !self.state.is_connected() {
            return Err(Error::ConnDown);
        }
        if let Some(limit) = self.fail_get_after {
            if self.delivered >= limit {
                self.state = ConnState::Disconnected;
                return Err(Error::Transport {
                    message: "scripted channel failure".into(),
                });
            }
        }
        match self.inbox.pop_front() {
            Some(msg) => {
                self.delivered += 1;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    fn conn_state(&self) -> ConnState {
        self.state
    }

    fn set_spa_keys(&mut self, encryption_key: &str, hmac_key: &str) -> Result<()> {
        self.spa_keys = Some((encryption_key.to_string(), hmac_key.to_string()));
        Ok(())
    }

    fn reconfigure(&mut self, _settings: ComSettings) -> Result<()> {
        self.reconfigure_count += 1;
        self.state = ConnState::Disconnected;
        self.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_send_roundtrip() {
        let mut chan = MockChannel::new();
        chan.connect().unwrap();
        chan.send_msg(r#"{"subject":"keep_alive"}"#).unwrap();
        assert_eq!(chan.sent().len(), 1);
    }

    #[test]
    fn send_while_disconnected_refused() {
        let mut chan = MockChannel::new();
        assert!(matches!(
            chan.send_msg(r#"{"subject":"keep_alive"}"#),
            Err(Error::ConnDown)
        ));
    }

    #[test]
    fn keep_alive_script_replies() {
        let mut chan = MockChannel::new().answer_keep_alives();
        chan.connect().unwrap();
        chan.send_msg(r#"{"subject":"keep_alive"}"#).unwrap();

        let reply = chan.get_msg().unwrap().unwrap();
        assert!(reply.contains("fulfilling"));
        assert!(chan.get_msg().unwrap().is_none());
    }

    #[test]
    fn fail_get_after_breaks_channel() {
        let mut chan = MockChannel::new().fail_get_after(0);
        chan.connect().unwrap();
        assert!(chan.get_msg().is_err());
        assert!(!chan.connected());
    }

    #[test]
    fn subject_filter_matches() {
        let mut chan = MockChannel::new();
        chan.connect().unwrap();
        chan.send_msg(r#"{"subject":"keep_alive"}"#).unwrap();
        chan.send_msg(r#"{"subject":"cred_update","stage":"requesting"}"#)
            .unwrap();

        assert_eq!(chan.sent_with_subject("keep_alive", None).len(), 1);
        assert_eq!(
            chan.sent_with_subject("cred_update", Some("requesting")).len(),
            1
        );
        assert_eq!(chan.sent_with_subject("cred_update", Some("fulfilled")).len(), 0);
    }
}
