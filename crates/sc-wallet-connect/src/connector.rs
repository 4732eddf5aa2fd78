use crate::config::ConnectConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ConnectError, ErrorClass};
use crate::events::{ConnectorCallback, ConnectorEvent, ConnectorEventKind, EventBus};
use crate::health::{HealthConfig, HealthMonitor, ProbeFn, SpawnFn, UnhealthyFn};
use crate::listeners::{EventSink, ListenerRegistry};
use crate::modal::ModalBridge;
use crate::platform::{PlatformAdapter, select_platform};
use crate::queue::RequestQueue;
use crate::reconnect::{ReconnectStats, ReconnectionController, RetryFailure};
use crate::retry::RetryPolicy;
use crate::session_store::{SessionStore, StoreTransition, is_session_valid};
use crate::state::ConnectionStateMachine;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sc_api_types::{
    Acknowledged, AssetBalance, CancelOfferRequest, ChainId, CommandResult, ConnectionState,
    ConnectionStatus, CreateOfferRequest, CreateOfferResponse, GetAddressResponse,
    GetPublicKeysRequest, SendTransactionRequest, SendTransactionResponse, Session,
    SignCoinSpendsRequest, SignMessageRequest, SignMessageResponse, TakeOfferRequest,
    TakeOfferResponse,
};
use sc_pairing_client::{
    ClientId, DisconnectReason, PairingClient, PendingPairing, SessionEvent, SessionEventKind,
};
use sc_storage::{InMemoryStore, KeyValueStore};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slack given to the monitor's own probe deadline so the connector's
/// probe timeout always settles first.
const PROBE_GRACE: Duration = Duration::from_secs(1);

enum PumpMessage {
    Event(SessionEvent),
    Flush(oneshot::Sender<()>),
}

struct Pump {
    tx: mpsc::UnboundedSender<PumpMessage>,
    sink: EventSink,
    handle: JoinHandle<()>,
}

struct Inner {
    client: Arc<dyn PairingClient>,
    config: ConnectConfig,
    platform: Arc<dyn PlatformAdapter>,
    registry: Arc<ListenerRegistry>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    machine: ConnectionStateMachine,
    reconnect: ReconnectionController,
    health: HealthMonitor,
    dispatcher: CommandDispatcher,
    modal: Arc<ModalBridge>,
    probe_timeout: Duration,
    pump: Mutex<Option<Pump>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

pub struct WalletConnectorBuilder {
    client: Arc<dyn PairingClient>,
    config: ConnectConfig,
    platform: Option<Arc<dyn PlatformAdapter>>,
    registry: Arc<ListenerRegistry>,
    storage: Option<Arc<dyn KeyValueStore>>,
    modal: Option<Arc<ModalBridge>>,
    retry_policy: Option<RetryPolicy>,
}

impl WalletConnectorBuilder {
    pub fn config(mut self, config: ConnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the adapter for `config.platform`.
    pub fn platform(mut self, platform: Arc<dyn PlatformAdapter>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn modal(mut self, modal: Arc<ModalBridge>) -> Self {
        self.modal = Some(modal);
        self
    }

    /// Overrides the platform's retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<WalletConnector, ConnectError> {
        self.config.validate()?;
        let config = self.config;

        let platform = self
            .platform
            .unwrap_or_else(|| select_platform(config.platform, None));
        let storage = self.storage.unwrap_or_else(|| {
            let fallback: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::default());
            fallback
        });

        let mut store = SessionStore::new(storage, &config.storage_prefix);
        if let Some(mirror) = platform.session_mirror() {
            store = store.with_mirror(mirror);
        }
        let store = Arc::new(store);
        let bus = Arc::new(EventBus::default());

        let queue = Arc::new(RequestQueue::new(self.client.clone()));
        let dispatcher = CommandDispatcher::new(
            queue,
            store.clone(),
            ChainId(config.chain_id.clone()),
            platform.request_timeout(&config),
        );
        let reconnect = ReconnectionController::new(
            self.retry_policy.unwrap_or_else(|| platform.retry_policy()),
            platform.jitter(),
        );
        let probe_timeout = platform.probe_timeout(&config);
        let spawner = platform.clone();
        let spawn: SpawnFn =
            Arc::new(move |task: BoxFuture<'static, ()>| spawner.spawn("health-check", task));
        let health = HealthMonitor::new(HealthConfig {
            interval: config.health_interval,
            probe_timeout: probe_timeout + PROBE_GRACE,
            max_consecutive_failures: config.health_max_failures,
        })
        .with_spawner(spawn);

        info!(
            client = %self.client.client_id(),
            platform = ?platform.kind(),
            environment = ?config.environment,
            chain = %config.chain_id,
            "wallet connector built"
        );

        Ok(WalletConnector {
            inner: Arc::new(Inner {
                client: self.client,
                platform,
                registry: self.registry,
                machine: ConnectionStateMachine::new(store.clone(), bus.clone()),
                store,
                bus,
                reconnect,
                health,
                dispatcher,
                modal: self.modal.unwrap_or_default(),
                probe_timeout,
                pump: Mutex::new(None),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                config,
            }),
        })
    }
}

/// Consumer-facing handle to the connection core. Cheap to clone.
#[derive(Clone)]
pub struct WalletConnector {
    inner: Arc<Inner>,
}

impl WalletConnector {
    /// Every connector built around the same client must share `registry`,
    /// so a remounted connector reuses the existing event bindings.
    pub fn builder(client: Arc<dyn PairingClient>, registry: Arc<ListenerRegistry>) -> WalletConnectorBuilder {
        WalletConnectorBuilder {
            client,
            config: ConnectConfig::default(),
            platform: None,
            registry,
            storage: None,
            modal: None,
            retry_policy: None,
        }
    }

    /// Wires session events and restores a previous session, either the one
    /// persisted locally or one the transport still holds. Repeat calls are
    /// no-ops.
    pub async fn initialize(&self) -> Result<ConnectionState, ConnectError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(ConnectError::Shutdown);
        }
        if inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(inner.machine.snapshot());
        }

        inner.platform.install_error_trap();
        inner.start_pump();
        inner.restore().await;
        Ok(inner.machine.snapshot())
    }

    /// Adopts `session` when given, otherwise pairs with a wallet, retrying
    /// transport failures per the retry policy.
    pub async fn connect(&self, session: Option<Session>) -> Result<ConnectionState, ConnectError> {
        self.inner.ensure_ready()?;
        match session {
            Some(session) => self.inner.adopt(session).await,
            None => self.inner.pair().await,
        }
    }

    pub async fn start_connection(&self) -> Result<ConnectionState, ConnectError> {
        self.connect(None).await
    }

    pub async fn open_modal(&self) -> Result<ConnectionState, ConnectError> {
        self.connect(None).await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(ConnectError::Shutdown);
        }

        inner.reconnect.cancel();
        inner.health.stop_health_check();
        if let Some(topic) = inner.store.active_topic() {
            if let Err(err) = inner
                .client
                .disconnect(&topic, DisconnectReason::user_disconnected())
                .await
            {
                warn!(topic = %topic, error = %err, "transport disconnect failed");
            }
        }
        inner.end_session("user disconnected", None).await;
        Ok(())
    }

    /// Raw wallet RPC. Failures other than caller errors are also noted on
    /// the connection state.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ConnectError> {
        self.inner.ensure_ready()?;
        let result = self.inner.dispatcher.request(method, params).await;
        if let Err(err) = &result {
            if err.class() != ErrorClass::Contract {
                self.inner.machine.note_error(err.to_string());
            }
        }
        result
    }

    pub async fn get_address(&self) -> Result<CommandResult<GetAddressResponse>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.get_address().await)
    }

    pub async fn get_balance(&self, asset_id: Option<String>) -> Result<CommandResult<AssetBalance>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.get_balance(asset_id).await)
    }

    pub async fn get_public_keys(
        &self,
        request: &GetPublicKeysRequest,
    ) -> Result<CommandResult<Vec<String>>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.get_public_keys(request).await)
    }

    pub async fn sign_message(
        &self,
        request: &SignMessageRequest,
    ) -> Result<CommandResult<SignMessageResponse>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.sign_message(request).await)
    }

    pub async fn send_transaction(
        &self,
        request: &SendTransactionRequest,
    ) -> Result<CommandResult<SendTransactionResponse>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.send_transaction(request).await)
    }

    pub async fn create_offer(
        &self,
        request: &CreateOfferRequest,
    ) -> Result<CommandResult<CreateOfferResponse>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.create_offer(request).await)
    }

    pub async fn take_offer(&self, request: &TakeOfferRequest) -> Result<CommandResult<TakeOfferResponse>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.take_offer(request).await)
    }

    pub async fn cancel_offer(&self, request: &CancelOfferRequest) -> Result<CommandResult<Acknowledged>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.cancel_offer(request).await)
    }

    pub async fn sign_coin_spends(
        &self,
        request: &SignCoinSpendsRequest,
    ) -> Result<CommandResult<String>, ConnectError> {
        self.inner.ensure_ready()?;
        self.track(self.inner.dispatcher.sign_coin_spends(request).await)
    }

    fn track<T>(&self, result: Result<CommandResult<T>, ConnectError>) -> Result<CommandResult<T>, ConnectError> {
        if let Ok(CommandResult {
            success: false,
            error: Some(message),
            ..
        }) = &result
        {
            self.inner.machine.note_error(message.clone());
        }
        result
    }

    pub fn get_state(&self) -> ConnectionState {
        self.inner.machine.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.machine.subscribe()
    }

    pub fn on(&self, kind: ConnectorEventKind, callback: ConnectorCallback) {
        self.inner.bus.on(kind, callback);
    }

    pub fn off(&self, kind: ConnectorEventKind) {
        self.inner.bus.off(kind);
    }

    /// Waits until every session event delivered so far has been applied.
    pub async fn flush_events(&self) {
        let tx = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|pump| pump.tx.clone());

        if let Some(tx) = tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PumpMessage::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Stops background work and releases this connector's event bindings.
    /// The persisted session is kept for the next launch.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.reconnect.cancel();
        inner.health.stop_health_check();

        let pump = inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            inner.registry.detach(inner.client.as_ref(), &pump.sink);
            pump.handle.abort();
        }
        info!(client = %inner.client.client_id(), "wallet connector shut down");
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.store.current()
    }

    pub fn last_connected_at(&self) -> Option<u64> {
        self.inner.store.last_connected_at()
    }

    pub fn store_transitions(&self) -> broadcast::Receiver<StoreTransition> {
        self.inner.store.subscribe()
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.inner.reconnect.stats()
    }

    pub fn modal(&self) -> Arc<ModalBridge> {
        self.inner.modal.clone()
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client.client_id()
    }
}

impl Inner {
    fn ensure_ready(&self) -> Result<(), ConnectError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConnectError::Shutdown);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ConnectError::NotInitialized);
        }
        Ok(())
    }

    fn start_pump(self: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink_tx = tx.clone();
        let sink: EventSink = Arc::new(move |event: SessionEvent| {
            if sink_tx.send(PumpMessage::Event(event)).is_err() {
                debug!("event pump closed, session event dropped");
            }
        });

        let bound = self
            .registry
            .route(self.client.as_ref(), &SessionEventKind::ALL, sink.clone());
        debug!(newly_bound = bound, "session events routed");

        let handle = self
            .platform
            .spawn("event-pump", run_pump(Arc::downgrade(self), rx).boxed());
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(Pump { tx, sink, handle });
    }

    fn route_to_pump(&self, event: SessionEvent) {
        let guard = self.pump.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pump) = guard.as_ref() {
            let _ = pump.tx.send(PumpMessage::Event(event));
        }
    }

    async fn restore(self: &Arc<Self>) {
        let live = self.client.sessions().await;

        let candidate = match self.store.load_session().await {
            Some(persisted) if live.iter().any(|s| s.topic == persisted.topic) => Some(persisted),
            Some(persisted) => {
                info!(topic = %persisted.topic, "persisted session unknown to transport, discarding");
                self.store.clear_session().await;
                None
            }
            None => live
                .into_iter()
                .filter(|s| s.acknowledged && is_session_valid(s))
                .max_by_key(|s| s.expiry),
        };

        let Some(session) = candidate else {
            debug!("no session to restore");
            return;
        };

        self.machine.begin_connecting();
        if let Err(err) = self.establish(session).await {
            warn!(error = %err, "session restore failed");
            self.store.clear_session().await;
            self.machine.disconnected(None);
        }
    }

    async fn adopt(self: &Arc<Self>, session: Session) -> Result<ConnectionState, ConnectError> {
        if self.reconnect.is_in_flight() {
            debug!(topic = %session.topic, "adopt refused, reconnection in flight");
            return Err(ConnectError::Busy);
        }
        self.machine.begin_connecting();
        match self.establish(session).await {
            Ok(()) => Ok(self.machine.snapshot()),
            Err(err) => {
                self.machine.disconnected(Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn pair(self: &Arc<Self>) -> Result<ConnectionState, ConnectError> {
        match self.machine.status() {
            ConnectionStatus::Healing => return Err(ConnectError::Busy),
            ConnectionStatus::Connected if self.store.current().is_some() => {
                debug!("already connected");
                return Ok(self.machine.snapshot());
            }
            ConnectionStatus::Connected => {
                self.end_session("session expired", None).await;
            }
            _ => {}
        }

        match self.reconnect.run(|_| self.pair_once()).await {
            Ok(()) => Ok(self.machine.snapshot()),
            Err(RetryFailure::Busy) => Err(ConnectError::Busy),
            Err(RetryFailure::Cancelled) | Err(RetryFailure::Aborted(ConnectError::Cancelled)) => {
                Err(ConnectError::Cancelled)
            }
            Err(failure) => {
                let err = failure.into_error();
                self.machine.disconnected(Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// One pairing attempt: request a URI, present it, wait for approval.
    async fn pair_once(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.machine.begin_connecting();
        let required = self.config.required_namespaces();

        let PendingPairing { uri, approval } = match self.client.connect(&required).await {
            Ok(pending) => pending,
            Err(err) => return Err(self.attempt_failed(err.into())),
        };

        self.bus.emit(&ConnectorEvent::PairingUri(uri.clone()));
        let mut closed = self.modal.closed_watch();
        let mut cancelled = self.reconnect.cancellation();
        self.platform.present_pairing(&self.modal, &uri);

        let approval_timeout = self.config.approval_timeout;
        let outcome = tokio::select! {
            result = approval => result.map_err(ConnectError::from),
            _ = closed.changed() => Err(ConnectError::ModalClosed),
            _ = cancelled.changed() => Err(ConnectError::Cancelled),
            _ = tokio::time::sleep(approval_timeout) => Err(ConnectError::Timeout {
                operation: "pairing approval",
                after: approval_timeout,
            }),
        };
        self.platform.dismiss_pairing(&self.modal);

        let result = match outcome {
            Ok(session) => self.establish(session).await,
            Err(err) => Err(err),
        };
        result.map_err(|err| self.attempt_failed(err))
    }

    /// Retryable failures show as `Error` while the next attempt is pending;
    /// terminal ones are settled by the caller.
    fn attempt_failed(&self, err: ConnectError) -> ConnectError {
        if err.is_retryable() {
            self.machine.failed(&err);
        }
        err
    }

    async fn establish(self: &Arc<Self>, session: Session) -> Result<(), ConnectError> {
        if !session.acknowledged {
            return Err(ConnectError::NotAcknowledged);
        }
        self.store.save_session(session.clone()).await?;
        self.machine.connected(&session)?;
        self.start_health();
        info!(topic = %session.topic, accounts = session.chia_accounts().len(), "wallet connected");
        Ok(())
    }

    fn start_health(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let probe: ProbeFn = Arc::new(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.probe().await,
                    None => Ok(()),
                }
            }
            .boxed()
        });

        let weak = Arc::downgrade(self);
        let platform = self.platform.clone();
        let on_unhealthy: UnhealthyFn = Box::new(move || {
            platform.spawn(
                "heal",
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.heal().await;
                    }
                }
                .boxed(),
            );
        });

        self.health.start_health_check(probe, Some(on_unhealthy));
    }

    async fn probe(&self) -> Result<(), ConnectError> {
        let Some(session) = self.store.current() else {
            if let Some(topic) = self.store.active_topic() {
                info!(topic = %topic, "session expired, treating as session_expire");
                self.route_to_pump(SessionEvent::Expire { topic });
                return Ok(());
            }
            return Err(ConnectError::NoSession);
        };

        let result = match tokio::time::timeout(self.probe_timeout, self.client.ping(&session.topic)).await {
            Ok(result) => result.map_err(ConnectError::from),
            Err(_) => Err(ConnectError::Timeout {
                operation: "health probe",
                after: self.probe_timeout,
            }),
        };
        self.machine.record_probe(result.is_ok());
        result
    }

    async fn heal(self: &Arc<Self>) {
        if !self.machine.begin_healing() {
            debug!("heal skipped, not connected");
            return;
        }
        let Some(topic) = self.store.active_topic() else {
            self.end_session("session lost", None).await;
            return;
        };
        info!(topic = %topic, "healing session");

        match self.reconnect.run(|_| self.heal_once(&topic)).await {
            Ok(session) => {
                if let Err(err) = self.store.save_session(session.clone()).await {
                    warn!(topic = %topic, error = %err, "healed session could not be stored");
                    self.end_session("session unhealthy", Some(err.to_string())).await;
                    return;
                }
                self.machine.healed(&session);
                self.start_health();
                info!(topic = %topic, "session healed");
            }
            Err(failure @ (RetryFailure::Busy | RetryFailure::Cancelled)) => {
                debug!(outcome = ?failure, "heal abandoned");
                if self.machine.status() == ConnectionStatus::Healing {
                    self.end_session("session unhealthy", Some(failure.into_error().to_string()))
                        .await;
                }
            }
            Err(failure) => {
                let err = failure.into_error();
                warn!(topic = %topic, error = %err, "healing failed");
                if let Err(err) = self
                    .client
                    .disconnect(&topic, DisconnectReason::session_unhealthy())
                    .await
                {
                    debug!(error = %err, "transport disconnect after failed heal");
                }
                self.end_session("session unhealthy", Some(err.to_string())).await;
            }
        }
    }

    async fn heal_once(&self, topic: &str) -> Result<Session, ConnectError> {
        let session = self
            .client
            .sessions()
            .await
            .into_iter()
            .find(|s| s.topic == topic)
            .ok_or_else(|| ConnectError::SessionNotFound(topic.to_owned()))?;
        if !is_session_valid(&session) {
            return Err(ConnectError::SessionExpired(topic.to_owned()));
        }

        let probe_timeout = self.probe_timeout;
        match tokio::time::timeout(probe_timeout, self.client.ping(topic)).await {
            Ok(result) => result.map_err(ConnectError::from)?,
            Err(_) => {
                return Err(ConnectError::Timeout {
                    operation: "session ping",
                    after: probe_timeout,
                });
            }
        }
        Ok(session)
    }

    async fn apply_event(&self, event: SessionEvent) {
        if self.store.active_topic().as_deref() != Some(event.topic()) {
            debug!(event = %event.kind(), topic = %event.topic(), "event for inactive topic ignored");
            return;
        }

        match event {
            SessionEvent::Update { topic, namespaces } => {
                if let Some(session) = self.store.update_namespaces(&topic, namespaces).await {
                    self.machine.remap(&session);
                    self.bus.emit(&ConnectorEvent::SessionUpdated(session));
                }
            }
            SessionEvent::Delete { topic } => {
                info!(topic = %topic, "session deleted by wallet");
                self.end_session("session deleted", None).await;
            }
            SessionEvent::Expire { topic } => {
                info!(topic = %topic, "session expired");
                self.end_session("session expired", None).await;
            }
            SessionEvent::Request { method, id, .. } => {
                debug!(method = %method, id, "wallet-initiated request ignored");
            }
        }
    }

    async fn end_session(&self, reason: &str, error: Option<String>) {
        self.health.stop_health_check();
        self.store.clear_session().await;
        self.machine.disconnected(error);
        self.bus.emit(&ConnectorEvent::Disconnected {
            reason: Some(reason.to_owned()),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pump = self.pump.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.handle.abort();
        }
    }
}

async fn run_pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<PumpMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            PumpMessage::Flush(done) => {
                let _ = done.send(());
            }
            PumpMessage::Event(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.apply_event(event).await;
            }
        }
    }
}
