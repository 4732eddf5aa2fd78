use sc_pairing_client::{ClientId, EventHandler, PairingClient, SessionEvent, SessionEventKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

type SinkSlot = Arc<Mutex<Option<EventSink>>>;

#[derive(Default)]
struct ClientEntry {
    events: BTreeSet<SessionEventKind>,
    sink: SinkSlot,
}

/// Which session events are bound on which transport client.
///
/// Keyed by [`ClientId`] rather than by client object, so a connector that
/// is rebuilt around the same client (or a fresh client for the same relay
/// and project) finds the existing bindings and does not add duplicates.
/// Share one registry per process.
#[derive(Default)]
pub struct ListenerRegistry {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
}

impl ListenerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds `handler` for `kind` unless the client identity already has a
    /// binding for it. Returns whether a handler was added.
    pub fn register(&self, client: &dyn PairingClient, kind: SessionEventKind, handler: EventHandler) -> bool {
        let id = client.client_id();
        let mut clients = self.lock();
        let entry = clients.entry(id.clone()).or_default();
        if !entry.events.insert(kind) {
            debug!(client = %id, event = %kind, "listener already registered");
            return false;
        }
        client.on(kind, handler);
        debug!(client = %id, event = %kind, "listener registered");
        true
    }

    /// Points every `kinds` event of this client at `sink`, replacing the
    /// previous sink. Returns how many new bindings were made.
    pub fn route(&self, client: &dyn PairingClient, kinds: &[SessionEventKind], sink: EventSink) -> usize {
        let slot = {
            let mut clients = self.lock();
            let entry = clients.entry(client.client_id()).or_default();
            *entry.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
            entry.sink.clone()
        };

        kinds
            .iter()
            .filter(|kind| self.register(client, **kind, forwarder(slot.clone())))
            .count()
    }

    /// Drops this client's bindings if `sink` is still the routed one. A sink
    /// that has since been replaced leaves the bindings alone.
    pub fn detach(&self, client: &dyn PairingClient, sink: &EventSink) -> bool {
        let owned = {
            let clients = self.lock();
            clients.get(&client.client_id()).is_some_and(|entry| {
                let mut current = entry.sink.lock().unwrap_or_else(|e| e.into_inner());
                let ours = current.as_ref().is_some_and(|routed| Arc::ptr_eq(routed, sink));
                if ours {
                    *current = None;
                }
                ours
            })
        };

        if owned {
            self.unregister_all(client);
        }
        owned
    }

    pub fn unregister(&self, client: &dyn PairingClient, kind: SessionEventKind) -> bool {
        let removed = self
            .lock()
            .get_mut(&client.client_id())
            .is_some_and(|entry| entry.events.remove(&kind));
        if removed {
            client.remove_all_listeners(kind);
        }
        removed
    }

    pub fn unregister_all(&self, client: &dyn PairingClient) {
        let events = self
            .lock()
            .get_mut(&client.client_id())
            .map(|entry| std::mem::take(&mut entry.events))
            .unwrap_or_default();
        for kind in events {
            client.remove_all_listeners(kind);
        }
    }

    pub fn is_registered(&self, client: &ClientId, kind: SessionEventKind) -> bool {
        self.lock()
            .get(client)
            .is_some_and(|entry| entry.events.contains(&kind))
    }

    pub fn bound_events(&self, client: &ClientId) -> Vec<SessionEventKind> {
        self.lock()
            .get(client)
            .map(|entry| entry.events.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn forwarder(slot: SinkSlot) -> EventHandler {
    Arc::new(move |event| {
        let sink = slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match sink {
            Some(sink) => sink(event),
            None => debug!(event = %event.kind(), "event dropped, no sink routed"),
        }
    })
}
