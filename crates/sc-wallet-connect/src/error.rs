use sc_pairing_client::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Relay or socket trouble. Recovered by retrying.
    Transport,
    /// Treated like `Transport` for retries, reported separately.
    Timeout,
    /// Explicit decline or a closed connection modal. Never retried.
    UserRejected,
    /// The wallet answered with an error payload.
    Wallet,
    /// The session is gone on the wallet/relay side; re-pairing is required.
    SessionLost,
    /// Caller misuse. Never retried or healed.
    Contract,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("{operation} timed out after {}ms; the wallet may be slow to respond", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("pairing rejected: {0}")]
    UserRejected(String),
    #[error("connection modal closed before the wallet approved")]
    ModalClosed,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("unexpected wallet response: {0}")]
    InvalidResponse(String),
    #[error("session was not acknowledged by the wallet")]
    NotAcknowledged,
    #[error("session {0} has expired")]
    SessionExpired(String),
    #[error("session {0} is no longer known to the relay")]
    SessionNotFound(String),
    #[error("no active wallet session")]
    NoSession,
    #[error("invalid request parameters: {0}")]
    InvalidRequest(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("connector is not initialized")]
    NotInitialized,
    #[error("a connection attempt is already in progress")]
    Busy,
    #[error("connector has been shut down")]
    Shutdown,
}

impl ConnectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectError::Transport(_) | ConnectError::NotAcknowledged => ErrorClass::Transport,
            ConnectError::Timeout { .. } => ErrorClass::Timeout,
            ConnectError::UserRejected(_) | ConnectError::ModalClosed | ConnectError::Cancelled => {
                ErrorClass::UserRejected
            }
            ConnectError::Wallet(_) | ConnectError::InvalidResponse(_) => ErrorClass::Wallet,
            ConnectError::SessionExpired(_) | ConnectError::SessionNotFound(_) => ErrorClass::SessionLost,
            ConnectError::NoSession
            | ConnectError::InvalidRequest(_)
            | ConnectError::Config(_)
            | ConnectError::NotInitialized
            | ConnectError::Busy
            | ConnectError::Shutdown => ErrorClass::Contract,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Timeout)
    }

    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(reason) => ConnectError::UserRejected(reason),
            TransportError::SessionNotFound(topic) => ConnectError::SessionNotFound(topic),
            other => ConnectError::Transport(other),
        }
    }
}
