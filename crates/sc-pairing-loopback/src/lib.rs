use async_trait::async_trait;
use futures_util::FutureExt;
use sc_api_types::{Namespace, RequiredNamespace, Session};
use sc_pairing_client::{
    ClientId, DisconnectReason, EventHandler, PairingClient, PendingPairing, RpcRequest,
    SessionEvent, SessionEventKind, TransportError,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOOPBACK_RELAY: &str = "loopback://relay";

/// In-process pairing client with a scripted wallet on the other end.
///
/// Connect outcomes, RPC responses and ping results are scripted up front;
/// lifecycle events are injected with [`LoopbackClient::emit`] and friends.
pub struct LoopbackClient {
    client_id: ClientId,
    config: LoopbackConfig,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub project_id: String,
    pub fingerprint: u32,
    pub session_ttl_secs: u64,
    pub request_latency: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            project_id: "loopback".to_owned(),
            fingerprint: 1_234_567,
            session_ttl_secs: 7 * 24 * 3600,
            request_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Approve,
    Reject(String),
    Fail(TransportError),
    Hang,
}

pub type Responder = Arc<dyn Fn(&RpcRequest) -> Result<Value, TransportError> + Send + Sync>;

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<String, Session>,
    connect_script: VecDeque<ConnectOutcome>,
    ping_script: VecDeque<Result<(), TransportError>>,
    handlers: HashMap<SessionEventKind, Vec<EventHandler>>,
    responder: Option<Responder>,
    requests: Vec<RpcRequest>,
    connect_calls: usize,
    ping_calls: usize,
    stall_pings: bool,
    disconnects: Vec<(String, DisconnectReason)>,
}

impl Default for LoopbackClient {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackClient {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            client_id: ClientId::derive(LOOPBACK_RELAY, &config.project_id),
            config,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.lock().connect_script.extend(outcomes);
    }

    pub fn script_ping(&self, results: impl IntoIterator<Item = Result<(), TransportError>>) {
        self.lock().ping_script.extend(results);
    }

    /// While set, pings never answer.
    pub fn stall_pings(&self, stalled: bool) {
        self.lock().stall_pings = stalled;
    }

    pub fn set_responder(&self, responder: Responder) {
        self.lock().responder = Some(responder);
    }

    pub fn insert_session(&self, session: Session) {
        self.lock().sessions.insert(session.topic.clone(), session);
    }

    pub fn session(&self, topic: &str) -> Option<Session> {
        self.lock().sessions.get(topic).cloned()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn ping_calls(&self) -> usize {
        self.lock().ping_calls
    }

    pub fn requests(&self) -> Vec<RpcRequest> {
        self.lock().requests.clone()
    }

    pub fn disconnects(&self) -> Vec<(String, DisconnectReason)> {
        self.lock().disconnects.clone()
    }

    pub fn handler_count(&self, event: SessionEventKind) -> usize {
        self.lock().handlers.get(&event).map(Vec::len).unwrap_or(0)
    }

    /// Highest number of requests observed executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Builds an approved session the way the wallet would for `required`.
    pub fn approved_session(&self, required: &BTreeMap<String, RequiredNamespace>) -> Session {
        let namespaces = required
            .iter()
            .map(|(name, ns)| {
                let accounts = ns
                    .chains
                    .iter()
                    .map(|chain| format!("{chain}:{}", self.config.fingerprint))
                    .collect();
                let namespace = Namespace {
                    accounts,
                    methods: ns.methods.clone(),
                    events: ns.events.clone(),
                };
                (name.clone(), namespace)
            })
            .collect();

        Session {
            topic: Uuid::new_v4().simple().to_string(),
            namespaces,
            expiry: epoch_secs() + self.config.session_ttl_secs,
            acknowledged: true,
            peer: None,
        }
    }

    /// Decodes and delivers a raw SDK event to every registered handler.
    pub fn emit(&self, name: &str, payload: Value) -> Result<usize, TransportError> {
        let event = SessionEvent::decode(name, &payload)?;
        let handlers = self
            .lock()
            .handlers
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            handler(event.clone());
        }
        Ok(handlers.len())
    }

    pub fn expire_session(&self, topic: &str) -> Result<usize, TransportError> {
        self.lock().sessions.remove(topic);
        self.emit("session_expire", json!({ "topic": topic }))
    }

    pub fn delete_session(&self, topic: &str) -> Result<usize, TransportError> {
        self.lock().sessions.remove(topic);
        self.emit("session_delete", json!({ "id": 1, "topic": topic }))
    }

    pub fn update_session(
        &self,
        topic: &str,
        namespaces: BTreeMap<String, Namespace>,
    ) -> Result<usize, TransportError> {
        if let Some(session) = self.lock().sessions.get_mut(topic) {
            session.namespaces = namespaces.clone();
        }
        self.emit(
            "session_update",
            json!({ "topic": topic, "params": { "namespaces": namespaces } }),
        )
    }
}

#[async_trait]
impl PairingClient for LoopbackClient {
    fn client_id(&self) -> ClientId {
        self.client_id.clone()
    }

    async fn connect(
        &self,
        required_namespaces: &BTreeMap<String, RequiredNamespace>,
    ) -> Result<PendingPairing, TransportError> {
        let outcome = {
            let mut inner = self.lock();
            inner.connect_calls += 1;
            inner.connect_script.pop_front().unwrap_or(ConnectOutcome::Approve)
        };

        let uri = format!(
            "wc:{}@2?relay-protocol=loopback&symKey={}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );

        let approval = match outcome {
            ConnectOutcome::Fail(err) => return Err(err),
            ConnectOutcome::Approve => {
                let session = self.approved_session(required_namespaces);
                self.insert_session(session.clone());
                futures_util::future::ready(Ok(session)).boxed()
            }
            ConnectOutcome::Reject(reason) => {
                futures_util::future::ready(Err(TransportError::Rejected(reason))).boxed()
            }
            ConnectOutcome::Hang => futures_util::future::pending().boxed(),
        };

        debug!(uri = %uri, "loopback pairing started");
        Ok(PendingPairing { uri, approval })
    }

    async fn request(&self, request: RpcRequest) -> Result<Value, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.config.request_latency.is_zero() {
            tokio::time::sleep(self.config.request_latency).await;
        }

        let (known, responder) = {
            let mut inner = self.lock();
            inner.requests.push(request.clone());
            (
                inner.sessions.contains_key(&request.topic),
                inner.responder.clone(),
            )
        };

        let result = if !known {
            Err(TransportError::SessionNotFound(request.topic.clone()))
        } else {
            match responder {
                Some(responder) => responder(&request),
                None => Ok(json!({ "data": {} })),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn disconnect(&self, topic: &str, reason: DisconnectReason) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.disconnects.push((topic.to_owned(), reason));
        match inner.sessions.remove(topic) {
            Some(_) => Ok(()),
            None => Err(TransportError::SessionNotFound(topic.to_owned())),
        }
    }

    async fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    async fn ping(&self, topic: &str) -> Result<(), TransportError> {
        let stalled = {
            let mut inner = self.lock();
            inner.ping_calls += 1;
            inner.stall_pings
        };
        if stalled {
            return futures_util::future::pending().await;
        }

        let mut inner = self.lock();
        if let Some(scripted) = inner.ping_script.pop_front() {
            return scripted;
        }
        if inner.sessions.contains_key(topic) {
            Ok(())
        } else {
            Err(TransportError::SessionNotFound(topic.to_owned()))
        }
    }

    fn on(&self, event: SessionEventKind, handler: EventHandler) {
        self.lock().handlers.entry(event).or_default().push(handler);
    }

    fn off(&self, event: SessionEventKind) {
        self.remove_all_listeners(event);
    }

    fn remove_all_listeners(&self, event: SessionEventKind) {
        if self.lock().handlers.remove(&event).is_none() {
            warn!(event = %event, "no listeners to remove");
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
