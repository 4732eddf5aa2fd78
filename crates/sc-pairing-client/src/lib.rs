use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sc_api_types::{ChainId, Namespace, RequiredNamespace, Session};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Stable identity of a transport client.
///
/// Two client objects built for the same relay and project share an identity,
/// so listener bookkeeping survives the object being recreated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn derive(relay_url: &str, project_id: &str) -> Self {
        let digest = Sha256::digest(format!("{relay_url}|{project_id}").as_bytes());
        Self(format!("client_{}", hex_lower(&digest[..16])))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("rejected by wallet: {0}")]
    Rejected(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub topic: String,
    pub chain_id: ChainId,
    pub method: String,
    pub params: Value,
}

/// Result of starting a pairing: a URI for the QR/deep link and a future that
/// resolves once the wallet approves or rejects.
pub struct PendingPairing {
    pub uri: String,
    pub approval: BoxFuture<'static, Result<Session, TransportError>>,
}

impl fmt::Debug for PendingPairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPairing")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub code: u32,
    pub message: String,
}

impl DisconnectReason {
    pub fn user_disconnected() -> Self {
        Self {
            code: 6000,
            message: "User disconnected".to_owned(),
        }
    }

    pub fn session_unhealthy() -> Self {
        Self {
            code: 6100,
            message: "Session failed health checks".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionEventKind {
    Update,
    Delete,
    Expire,
    Request,
}

impl SessionEventKind {
    pub const ALL: [SessionEventKind; 4] = [
        SessionEventKind::Update,
        SessionEventKind::Delete,
        SessionEventKind::Expire,
        SessionEventKind::Request,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Update => "session_update",
            SessionEventKind::Delete => "session_delete",
            SessionEventKind::Expire => "session_expire",
            SessionEventKind::Request => "session_request",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle event, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Update {
        topic: String,
        namespaces: BTreeMap<String, Namespace>,
    },
    Delete {
        topic: String,
    },
    Expire {
        topic: String,
    },
    Request {
        topic: String,
        id: u64,
        method: String,
        params: Value,
    },
}

// ── Wire shapes of the SDK's event payloads ──

#[derive(Deserialize)]
struct TopicPayload {
    topic: String,
}

#[derive(Deserialize)]
struct UpdatePayload {
    topic: String,
    params: UpdateParams,
}

#[derive(Deserialize)]
struct UpdateParams {
    namespaces: BTreeMap<String, Namespace>,
}

#[derive(Deserialize)]
struct RequestPayload {
    id: u64,
    topic: String,
    params: RequestParams,
}

#[derive(Deserialize)]
struct RequestParams {
    request: InnerRequest,
}

#[derive(Deserialize)]
struct InnerRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Update { .. } => SessionEventKind::Update,
            SessionEvent::Delete { .. } => SessionEventKind::Delete,
            SessionEvent::Expire { .. } => SessionEventKind::Expire,
            SessionEvent::Request { .. } => SessionEventKind::Request,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            SessionEvent::Update { topic, .. }
            | SessionEvent::Delete { topic }
            | SessionEvent::Expire { topic }
            | SessionEvent::Request { topic, .. } => topic,
        }
    }

    pub fn decode(name: &str, payload: &Value) -> Result<Self, TransportError> {
        let kind = SessionEventKind::from_name(name)
            .ok_or_else(|| TransportError::Malformed(format!("unknown event '{name}'")))?;
        let malformed = |err: serde_json::Error| TransportError::Malformed(format!("{name}: {err}"));

        let event = match kind {
            SessionEventKind::Update => {
                let body = UpdatePayload::deserialize(payload).map_err(malformed)?;
                SessionEvent::Update {
                    topic: body.topic,
                    namespaces: body.params.namespaces,
                }
            }
            SessionEventKind::Delete => {
                let body = TopicPayload::deserialize(payload).map_err(malformed)?;
                SessionEvent::Delete { topic: body.topic }
            }
            SessionEventKind::Expire => {
                let body = TopicPayload::deserialize(payload).map_err(malformed)?;
                SessionEvent::Expire { topic: body.topic }
            }
            SessionEventKind::Request => {
                let body = RequestPayload::deserialize(payload).map_err(malformed)?;
                SessionEvent::Request {
                    topic: body.topic,
                    id: body.id,
                    method: body.params.request.method,
                    params: body.params.request.params,
                }
            }
        };

        Ok(event)
    }
}

pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// The pairing SDK as seen by the connection core.
///
/// Implementations own relay transport and pairing cryptography. `on` behaves
/// like a plain event emitter: every call adds another handler.
#[async_trait]
pub trait PairingClient: Send + Sync {
    fn client_id(&self) -> ClientId;

    async fn connect(
        &self,
        required_namespaces: &BTreeMap<String, RequiredNamespace>,
    ) -> Result<PendingPairing, TransportError>;

    async fn request(&self, request: RpcRequest) -> Result<Value, TransportError>;

    async fn disconnect(&self, topic: &str, reason: DisconnectReason) -> Result<(), TransportError>;

    async fn sessions(&self) -> Vec<Session>;

    async fn ping(&self, topic: &str) -> Result<(), TransportError>;

    fn on(&self, event: SessionEventKind, handler: EventHandler);

    fn off(&self, event: SessionEventKind);

    fn remove_all_listeners(&self, event: SessionEventKind);
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
