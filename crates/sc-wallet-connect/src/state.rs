use crate::error::ConnectError;
use crate::events::{ConnectorEvent, EventBus};
use crate::session_store::SessionStore;
use sc_api_types::{ConnectionState, ConnectionStatus, Session};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug)]
struct Machine {
    status: ConnectionStatus,
    accounts: Vec<String>,
    chain_id: Option<String>,
    error: Option<String>,
    connection_attempts: u32,
    last_probe_ok: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            accounts: Vec::new(),
            chain_id: None,
            error: None,
            connection_attempts: 0,
            last_probe_ok: true,
        }
    }
}

/// Umbrella connection status.
///
/// Reads the session through the [`SessionStore`] but never mutates it.
/// Every applied transition is published to `subscribe()` receivers and as
/// a `StateChanged` event.
pub struct ConnectionStateMachine {
    machine: Mutex<Machine>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new(store: Arc<SessionStore>, bus: Arc<EventBus>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            machine: Mutex::new(Machine::default()),
            store,
            bus,
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionState {
        let session_valid = self.store.current().is_some();
        let machine = self.lock();
        derive_state(&machine, session_valid)
    }

    /// Starts a connect attempt. Refused while connected or healing.
    pub fn begin_connecting(&self) -> bool {
        self.transition("connecting", |m| match m.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error | ConnectionStatus::Connecting => {
                m.status = ConnectionStatus::Connecting;
                m.connection_attempts += 1;
                true
            }
            ConnectionStatus::Connected | ConnectionStatus::Healing => false,
        })
    }

    /// Enters `Connected` with accounts and chain id mapped from `session`.
    pub fn connected(&self, session: &Session) -> Result<(), ConnectError> {
        if !session.acknowledged {
            return Err(ConnectError::NotAcknowledged);
        }
        self.transition("connected", |m| {
            m.status = ConnectionStatus::Connected;
            map_session(m, session);
            m.connection_attempts = 0;
            m.error = None;
            m.last_probe_ok = true;
            true
        });
        Ok(())
    }

    /// A failed attempt. Accounts of an existing session are kept.
    pub fn failed(&self, err: &ConnectError) {
        self.transition("error", |m| {
            m.status = ConnectionStatus::Error;
            m.error = Some(err.to_string());
            true
        });
    }

    /// Records an error message without changing status.
    pub fn note_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.transition("note_error", |m| {
            m.error = Some(message);
            true
        });
    }

    pub fn begin_healing(&self) -> bool {
        self.transition("healing", |m| {
            if m.status != ConnectionStatus::Connected {
                return false;
            }
            m.status = ConnectionStatus::Healing;
            m.last_probe_ok = false;
            true
        })
    }

    pub fn healed(&self, session: &Session) -> bool {
        self.transition("healed", |m| {
            if m.status != ConnectionStatus::Healing {
                return false;
            }
            m.status = ConnectionStatus::Connected;
            map_session(m, session);
            m.connection_attempts = 0;
            m.error = None;
            m.last_probe_ok = true;
            true
        })
    }

    /// Re-derives accounts and chain id after a session update.
    pub fn remap(&self, session: &Session) -> bool {
        self.transition("remap", |m| {
            if !matches!(m.status, ConnectionStatus::Connected | ConnectionStatus::Healing) {
                return false;
            }
            map_session(m, session);
            true
        })
    }

    pub fn record_probe(&self, ok: bool) {
        self.transition("probe", |m| {
            let changed = m.last_probe_ok != ok;
            m.last_probe_ok = ok;
            changed
        });
    }

    pub fn disconnected(&self, error: Option<String>) {
        self.transition("disconnected", |m| {
            *m = Machine {
                error,
                ..Machine::default()
            };
            true
        });
    }

    fn transition(&self, name: &'static str, apply: impl FnOnce(&mut Machine) -> bool) -> bool {
        let (applied, from, to) = {
            let mut machine = self.lock();
            let from = machine.status;
            let applied = apply(&mut machine);
            (applied, from, machine.status)
        };

        if !applied {
            debug!(transition = name, status = ?from, "transition not applicable");
            return false;
        }
        if from != to {
            info!(from = ?from, to = ?to, "connection status changed");
        }

        let state = self.snapshot();
        self.state_tx.send_replace(state.clone());
        self.bus.emit(&ConnectorEvent::StateChanged(state));
        true
    }
}

fn map_session(machine: &mut Machine, session: &Session) {
    machine.accounts = session.chia_accounts().to_vec();
    machine.chain_id = session.chain_id().map(|chain| chain.0);
}

fn derive_state(machine: &Machine, session_valid: bool) -> ConnectionState {
    let status = machine.status;
    ConnectionState {
        status,
        is_connected: status == ConnectionStatus::Connected && machine.last_probe_ok && session_valid,
        is_connecting: status == ConnectionStatus::Connecting,
        is_healing: status == ConnectionStatus::Healing,
        accounts: machine.accounts.clone(),
        chain_id: machine.chain_id.clone(),
        error: machine.error.clone(),
        connection_attempts: machine.connection_attempts,
    }
}
