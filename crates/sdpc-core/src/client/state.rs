//! Control client state machine states.

/// Where the client is in its request/response cycle.
///
/// Only the control loop mutates this; signal handlers communicate
/// through sticky flags the loop observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Session up, no outstanding request.
    #[default]
    Ready,
    /// Keep-alive sent, awaiting the reply within this cycle.
    KeepAliveRequesting,
    /// Keep-alive reply missed; a retry is pending.
    KeepAliveUnfulfilled,
    /// Credential update requested, awaiting delivery.
    CredRequesting,
    /// Credential delivery missed; a retry is pending.
    CredUnfulfilled,
    /// Terminal; the loop exits at its next check.
    TimeToQuit,
}

impl ClientState {
    /// States from which a keep-alive request may be transmitted.
    pub fn allows_keep_alive(&self) -> bool {
        matches!(
            self,
            ClientState::Ready
                | ClientState::KeepAliveRequesting
                | ClientState::KeepAliveUnfulfilled
        )
    }

    /// States from which a credential update request may be transmitted.
    pub fn allows_cred_request(&self) -> bool {
        matches!(
            self,
            ClientState::Ready | ClientState::CredRequesting | ClientState::CredUnfulfilled
        )
    }

    /// True while a keep-alive exchange is outstanding.
    pub fn in_keep_alive_cycle(&self) -> bool {
        matches!(
            self,
            ClientState::KeepAliveRequesting | ClientState::KeepAliveUnfulfilled
        )
    }

    /// True while a credential exchange is outstanding.
    pub fn in_cred_cycle(&self) -> bool {
        matches!(
            self,
            ClientState::CredRequesting | ClientState::CredUnfulfilled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Ready => "Ready",
            ClientState::KeepAliveRequesting => "KeepAliveRequesting",
            ClientState::KeepAliveUnfulfilled => "KeepAliveUnfulfilled",
            ClientState::CredRequesting => "CredRequesting",
            ClientState::CredUnfulfilled => "CredUnfulfilled",
            ClientState::TimeToQuit => "TimeToQuit",
        }
    }
}
