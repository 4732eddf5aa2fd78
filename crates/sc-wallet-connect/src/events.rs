use sc_api_types::{ConnectionState, Session};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorEventKind {
    StateChanged,
    SessionUpdated,
    Disconnected,
    PairingUri,
}

impl ConnectorEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorEventKind::StateChanged => "state_changed",
            ConnectorEventKind::SessionUpdated => "session_updated",
            ConnectorEventKind::Disconnected => "disconnected",
            ConnectorEventKind::PairingUri => "pairing_uri",
        }
    }
}

impl fmt::Display for ConnectorEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    StateChanged(ConnectionState),
    SessionUpdated(Session),
    Disconnected { reason: Option<String> },
    /// URI to render as a QR code or deep link.
    PairingUri(String),
}

impl ConnectorEvent {
    pub fn kind(&self) -> ConnectorEventKind {
        match self {
            ConnectorEvent::StateChanged(_) => ConnectorEventKind::StateChanged,
            ConnectorEvent::SessionUpdated(_) => ConnectorEventKind::SessionUpdated,
            ConnectorEvent::Disconnected { .. } => ConnectorEventKind::Disconnected,
            ConnectorEvent::PairingUri(_) => ConnectorEventKind::PairingUri,
        }
    }
}

pub type ConnectorCallback = Arc<dyn Fn(&ConnectorEvent) + Send + Sync>;

/// Consumer-facing callbacks keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    callbacks: Mutex<HashMap<ConnectorEventKind, Vec<ConnectorCallback>>>,
}

impl EventBus {
    pub fn on(&self, kind: ConnectorEventKind, callback: ConnectorCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(callback);
    }

    /// Drops every callback for `kind`.
    pub fn off(&self, kind: ConnectorEventKind) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
    }

    pub fn listener_count(&self, kind: ConnectorEventKind) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn emit(&self, event: &ConnectorEvent) {
        // Callbacks run outside the lock so they may call on/off.
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            callback(event);
        }
    }
}
