use sc_api_types::{CHIA_NAMESPACE, ConnectionStatus, Namespace};
use sc_pairing_client::{DisconnectReason, RpcRequest, SessionEventKind, TransportError};
use sc_pairing_loopback::{ConnectOutcome, LoopbackClient};
use sc_storage::{InMemoryStore, KeyValueStore};
use sc_wallet_connect::{
    ConnectConfig, ConnectError, ConnectorEvent, ConnectorEventKind, ListenerRegistry, ModalSignal,
    PlatformKind, SessionStore, WalletConnector, select_platform,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const SESSION_KEY: &str = "sage-connect.session";

struct Harness {
    client: Arc<LoopbackClient>,
    storage: Arc<InMemoryStore>,
    connector: WalletConnector,
    events: Arc<Mutex<Vec<ConnectorEvent>>>,
}

impl Harness {
    fn new(client: Arc<LoopbackClient>) -> Self {
        Self::with_registry(client, Arc::new(ListenerRegistry::default()))
    }

    fn with_registry(client: Arc<LoopbackClient>, registry: Arc<ListenerRegistry>) -> Self {
        let storage = Arc::new(InMemoryStore::default());
        let connector = WalletConnector::builder(client.clone(), registry)
            .storage(storage.clone())
            .build()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            ConnectorEventKind::StateChanged,
            ConnectorEventKind::Disconnected,
            ConnectorEventKind::SessionUpdated,
        ] {
            let events = events.clone();
            connector.on(
                kind,
                Arc::new(move |event: &ConnectorEvent| events.lock().unwrap().push(event.clone())),
            );
        }

        Self {
            client,
            storage,
            connector,
            events,
        }
    }

    fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            if let ConnectorEvent::StateChanged(state) = event {
                if statuses.last() != Some(&state.status) {
                    statuses.push(state.status);
                }
            }
        }
        statuses
    }

    fn disconnect_reasons(&self) -> Vec<Option<String>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ConnectorEvent::Disconnected { reason } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn topic(&self) -> String {
        self.connector.session().unwrap().topic
    }
}

fn unreachable() -> ConnectOutcome {
    ConnectOutcome::Fail(TransportError::Unreachable("relay down".to_owned()))
}

#[tokio::test(start_paused = true)]
async fn scenario_a_first_attempt_connects() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();

    let state = h.connector.connect(None).await.unwrap();

    assert_eq!(h.statuses(), vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]);
    assert!(state.is_connected);
    assert!(!state.is_connecting && !state.is_healing);
    assert_eq!(state.connection_attempts, 0);
    assert_eq!(state.accounts, vec!["chia:mainnet:1234567".to_owned()]);
    assert_eq!(state.chain_id.as_deref(), Some("chia:mainnet"));
    assert_eq!(h.client.connect_calls(), 1);
    assert!(h.storage.get(SESSION_KEY).await.unwrap().is_some());
    assert!(h.connector.last_connected_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_two_failures_then_success() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.client.script_connect([unreachable(), unreachable(), ConnectOutcome::Approve]);
    h.connector.initialize().await.unwrap();
    let started = Instant::now();

    let state = h.connector.connect(None).await.unwrap();

    // Two backoff delays with the default policy: 1s, then 2s.
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(h.client.connect_calls(), 3);
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.connection_attempts, 0);
    assert_eq!(state.error, None);
    assert_eq!(
        h.statuses(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Error,
            ConnectionStatus::Connecting,
            ConnectionStatus::Error,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
    assert_eq!(h.connector.reconnect_stats().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_rejection_is_terminal() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.client.script_connect([ConnectOutcome::Reject("user declined".to_owned())]);
    h.connector.initialize().await.unwrap();
    let started = Instant::now();

    let err = h.connector.connect(None).await.unwrap_err();

    assert_eq!(err, ConnectError::UserRejected("user declined".to_owned()));
    assert_eq!(h.statuses(), vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]);
    assert_eq!(h.client.connect_calls(), 1);
    assert_eq!(h.connector.reconnect_stats().retry_count, 0);
    assert_eq!(started.elapsed(), Duration::ZERO);

    let state = h.connector.get_state();
    assert!(!state.is_connected);
    assert!(state.error.unwrap().contains("user declined"));
}

#[tokio::test(start_paused = true)]
async fn scenario_d_expire_event_disconnects_and_clears_storage() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    let topic = h.topic();

    assert_eq!(h.client.expire_session(&topic).unwrap(), 1);
    h.connector.flush_events().await;

    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(!state.is_connected);
    assert!(state.accounts.is_empty());
    assert_eq!(h.storage.get(SESSION_KEY).await.unwrap(), None);
    assert_eq!(h.connector.session(), None);
    assert_eq!(h.disconnect_reasons(), vec![Some("session expired".to_owned())]);
}

#[tokio::test(start_paused = true)]
async fn wallet_delete_disconnects() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();

    h.client.delete_session(&h.topic()).unwrap();
    h.connector.flush_events().await;

    assert_eq!(h.connector.get_state().status, ConnectionStatus::Disconnected);
    assert_eq!(h.disconnect_reasons(), vec![Some("session deleted".to_owned())]);
}

#[tokio::test(start_paused = true)]
async fn events_for_other_topics_are_ignored() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();

    h.client
        .emit("session_expire", json!({ "topic": "someone-else" }))
        .unwrap();
    h.connector.flush_events().await;

    assert!(h.connector.get_state().is_connected);
}

#[tokio::test(start_paused = true)]
async fn session_update_remaps_accounts_without_reconnecting() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    let topic = h.topic();

    let mut namespaces = BTreeMap::new();
    namespaces.insert(
        CHIA_NAMESPACE.to_owned(),
        Namespace {
            accounts: vec!["chia:testnet:42".to_owned()],
            ..Namespace::default()
        },
    );
    h.client.update_session(&topic, namespaces).unwrap();
    h.connector.flush_events().await;

    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert_eq!(state.accounts, vec!["chia:testnet:42".to_owned()]);
    assert_eq!(state.chain_id.as_deref(), Some("chia:testnet"));
    assert_eq!(h.connector.session().unwrap().fingerprint(), Some(42));
    assert!(
        h.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ConnectorEvent::SessionUpdated(s) if s.topic == topic))
    );
}

#[tokio::test(start_paused = true)]
async fn remount_keeps_a_single_binding_per_client() {
    let client = Arc::new(LoopbackClient::default());
    let registry = Arc::new(ListenerRegistry::default());

    let first = Harness::with_registry(client.clone(), registry.clone());
    first.connector.initialize().await.unwrap();
    let second = Harness::with_registry(client.clone(), registry.clone());
    second.connector.initialize().await.unwrap();

    for kind in SessionEventKind::ALL {
        assert_eq!(client.handler_count(kind), 1, "{kind} bound more than once");
    }

    second.connector.connect(None).await.unwrap();
    let topic = second.topic();

    // The unmounted instance must not drop the live bindings.
    first.connector.shutdown();
    assert_eq!(client.handler_count(SessionEventKind::Expire), 1);

    client.expire_session(&topic).unwrap();
    second.connector.flush_events().await;

    assert_eq!(second.connector.get_state().status, ConnectionStatus::Disconnected);
    assert_eq!(second.disconnect_reasons().len(), 1);
    assert!(first.disconnect_reasons().is_empty());
}

#[tokio::test(start_paused = true)]
async fn initialize_restores_a_persisted_session() {
    let client = Arc::new(LoopbackClient::default());
    let session = client.approved_session(&ConnectConfig::default().required_namespaces());
    client.insert_session(session.clone());

    let storage = Arc::new(InMemoryStore::default());
    SessionStore::new(storage.clone(), "sage-connect.")
        .save_session(session.clone())
        .await
        .unwrap();

    let connector = WalletConnector::builder(client.clone(), Arc::new(ListenerRegistry::default()))
        .storage(storage)
        .build()
        .unwrap();
    let state = connector.initialize().await.unwrap();

    assert!(state.is_connected);
    assert_eq!(client.connect_calls(), 0);
    assert_eq!(connector.session().map(|s| s.topic), Some(session.topic));
}

#[tokio::test(start_paused = true)]
async fn initialize_adopts_a_session_the_transport_still_holds() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    let session = h
        .client
        .approved_session(&ConnectConfig::default().required_namespaces());
    h.client.insert_session(session.clone());

    let state = h.connector.initialize().await.unwrap();

    assert!(state.is_connected);
    assert_eq!(h.topic(), session.topic);
    assert!(h.storage.get(SESSION_KEY).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn initialize_discards_a_session_the_transport_forgot() {
    let client = Arc::new(LoopbackClient::default());
    let session = client.approved_session(&ConnectConfig::default().required_namespaces());

    let storage = Arc::new(InMemoryStore::default());
    SessionStore::new(storage.clone(), "sage-connect.")
        .save_session(session)
        .await
        .unwrap();

    let connector = WalletConnector::builder(client, Arc::new(ListenerRegistry::default()))
        .storage(storage.clone())
        .build()
        .unwrap();
    let state = connector.initialize().await.unwrap();

    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(storage.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn failed_probes_trigger_a_successful_heal() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();

    // The wallet extends the session while the relay is flaky.
    let mut extended = h.client.session(&h.topic()).unwrap();
    extended.expiry += 3600;
    h.client.insert_session(extended.clone());

    let closed = || -> Result<(), TransportError> { Err(TransportError::Closed("socket closed".to_owned())) };
    h.client.script_ping([closed(), closed(), closed()]);

    // Probes at 30s, 60s and 90s fail; the heal ping succeeds.
    tokio::time::sleep(Duration::from_secs(100)).await;

    assert_eq!(h.client.ping_calls(), 4);
    assert_eq!(h.connector.session().unwrap().expiry, extended.expiry);
    let stored = h.storage.get(SESSION_KEY).await.unwrap().unwrap();
    assert!(stored.contains(&extended.expiry.to_string()));
    let statuses = h.statuses();
    assert!(statuses.contains(&ConnectionStatus::Healing));
    assert_eq!(statuses.last(), Some(&ConnectionStatus::Connected));

    let state = h.connector.get_state();
    assert!(state.is_connected);
    assert_eq!(state.connection_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_heal_ends_the_session() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    let topic = h.topic();

    // Three failed probes, then every heal attempt fails too.
    h.client.script_ping((0..8).map(|_| Err(TransportError::Closed("socket closed".to_owned()))));

    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(h.client.ping_calls(), 8);
    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.error.is_some());
    assert_eq!(h.storage.get(SESSION_KEY).await.unwrap(), None);
    assert_eq!(
        h.client.disconnects(),
        vec![(topic, DisconnectReason::session_unhealthy())]
    );
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_notifies_transport_and_clears_state() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    let topic = h.topic();

    h.connector.disconnect().await.unwrap();
    h.connector.disconnect().await.unwrap();

    assert_eq!(
        h.client.disconnects()[0],
        (topic, DisconnectReason::user_disconnected())
    );
    assert_eq!(h.client.disconnects().len(), 1);
    assert_eq!(h.connector.get_state().status, ConnectionStatus::Disconnected);
    assert!(h.storage.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn closing_the_modal_aborts_pairing_without_retry() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.client.script_connect([ConnectOutcome::Hang]);
    h.connector.initialize().await.unwrap();

    let modal = h.connector.modal();
    let mut signals = modal.subscribe();
    let connector = h.connector.clone();
    let pending = tokio::spawn(async move { connector.connect(None).await });

    match signals.recv().await.unwrap() {
        ModalSignal::Show { uri } => assert!(uri.starts_with("wc:")),
        other => panic!("unexpected signal {other:?}"),
    }
    modal.report_closed();

    let result = pending.await.unwrap();
    assert_eq!(result, Err(ConnectError::ModalClosed));
    assert_eq!(signals.recv().await.unwrap(), ModalSignal::Hide);
    assert_eq!(h.client.connect_calls(), 1);
    assert_eq!(h.connector.get_state().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_never_adopted() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();

    let mut session = h
        .client
        .approved_session(&ConnectConfig::default().required_namespaces());
    session.expiry = 1;

    let err = h.connector.connect(Some(session.clone())).await.unwrap_err();
    assert_eq!(err, ConnectError::SessionExpired(session.topic));

    let state = h.connector.get_state();
    assert!(!state.is_connected);
    assert_eq!(state.status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn requests_need_a_session_and_report_wallet_errors() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    assert_eq!(h.connector.get_address().await, Err(ConnectError::NotInitialized));

    h.connector.initialize().await.unwrap();
    assert_eq!(h.connector.get_address().await, Err(ConnectError::NoSession));

    h.connector.connect(None).await.unwrap();
    h.client.set_responder(Arc::new(|request: &RpcRequest| -> Result<Value, TransportError> {
        if request.method == "chia_getAddress" {
            Ok(json!({ "data": { "address": "xch1qqq" } }))
        } else {
            Ok(json!({ "error": "Wallet is locked" }))
        }
    }));

    let address = h.connector.get_address().await.unwrap();
    assert_eq!(address.into_result().unwrap().address, "xch1qqq");
    assert_eq!(h.client.requests()[0].params, json!({ "fingerprint": 1234567 }));

    let balance = h.connector.get_balance(None).await.unwrap();
    assert!(!balance.success);

    let state = h.connector.get_state();
    assert!(state.is_connected, "a wallet error must not disconnect");
    assert_eq!(state.error.as_deref(), Some("wallet error: Wallet is locked"));
}

#[tokio::test(start_paused = true)]
async fn constrained_platform_mirrors_the_session() {
    let client = Arc::new(LoopbackClient::default());
    let mirror: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::default());
    let config = ConnectConfig {
        platform: PlatformKind::Constrained,
        ..ConnectConfig::default()
    };

    let connector = WalletConnector::builder(client, Arc::new(ListenerRegistry::default()))
        .config(config.clone())
        .platform(select_platform(config.platform, Some(mirror.clone())))
        .build()
        .unwrap();
    connector.initialize().await.unwrap();
    connector.connect(None).await.unwrap();

    let raw = mirror.get(SESSION_KEY).await.unwrap().unwrap();
    assert!(raw.contains(&connector.session().unwrap().topic));
}

#[tokio::test(start_paused = true)]
async fn shut_down_connector_refuses_work() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.shutdown();

    assert_eq!(h.connector.connect(None).await, Err(ConnectError::Shutdown));
    assert_eq!(h.connector.initialize().await, Err(ConnectError::Shutdown));
    assert_eq!(h.client.handler_count(SessionEventKind::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_clears_is_connected_until_the_next_success() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    h.client
        .script_ping([Err(TransportError::Closed("socket closed".to_owned()))]);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert!(!state.is_connected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.connector.get_state().is_connected);
}

#[tokio::test(start_paused = true)]
async fn unanswered_probe_clears_is_connected() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();
    h.client.stall_pings(true);

    // Probe at 30s, probe timeout of 5s.
    tokio::time::sleep(Duration::from_secs(40)).await;

    let state = h.connector.get_state();
    assert_eq!(h.client.ping_calls(), 1);
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert!(!state.is_connected);
}

#[tokio::test(start_paused = true)]
async fn adopting_during_a_pending_pairing_is_refused() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.client.script_connect([ConnectOutcome::Hang]);
    h.connector.initialize().await.unwrap();

    let mut signals = h.connector.modal().subscribe();
    let connector = h.connector.clone();
    let pairing = tokio::spawn(async move { connector.connect(None).await });
    assert!(matches!(signals.recv().await.unwrap(), ModalSignal::Show { .. }));

    let session = h
        .client
        .approved_session(&ConnectConfig::default().required_namespaces());
    h.client.insert_session(session.clone());

    assert_eq!(h.connector.connect(Some(session)).await, Err(ConnectError::Busy));
    assert_eq!(h.connector.get_state().status, ConnectionStatus::Connecting);
    assert_eq!(h.connector.session(), None);

    h.connector.disconnect().await.unwrap();
    assert_eq!(pairing.await.unwrap(), Err(ConnectError::Cancelled));

    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(!state.is_connecting && !state.is_healing);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_heal_does_not_leave_healing() {
    let h = Harness::new(Arc::new(LoopbackClient::default()));
    h.connector.initialize().await.unwrap();
    h.connector.connect(None).await.unwrap();

    // Three failed probes and a failed first heal attempt.
    h.client.script_ping((0..4).map(|_| Err(TransportError::Closed("socket closed".to_owned()))));

    // The heal is waiting out its first backoff delay.
    tokio::time::sleep(Duration::from_millis(90_500)).await;
    assert_eq!(h.connector.get_state().status, ConnectionStatus::Healing);
    assert_eq!(h.client.ping_calls(), 4);

    h.connector.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    let state = h.connector.get_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(!state.is_healing);
    assert_eq!(h.client.ping_calls(), 4);
    assert!(h.storage.is_empty().await);
}
