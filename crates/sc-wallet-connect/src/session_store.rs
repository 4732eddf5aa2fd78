use crate::error::ConnectError;
use sc_api_types::{Namespace, Session};
use sc_storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `true` iff `expiry > now`.
pub fn is_session_valid(session: &Session) -> bool {
    is_session_valid_at(session, epoch_secs())
}

pub fn is_session_valid_at(session: &Session, now_epoch_secs: u64) -> bool {
    !session.topic.is_empty() && !session.is_expired_at(now_epoch_secs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTransition {
    Saved { topic: String },
    Updated { topic: String },
    Restored { topic: String },
    Cleared { topic: Option<String> },
    /// A stored session was unreadable or expired and has been removed.
    Purged { reason: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    session: Session,
    last_connected_at: u64,
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    last_connected_at: Option<u64>,
}

/// Owner of the single active session.
///
/// Every mutation goes through `save_session`, `update_namespaces` or
/// `clear_session` and is broadcast as a [`StoreTransition`]. Storage
/// failures never reach the caller: reads fail open to "no session" and
/// writes are logged.
pub struct SessionStore {
    primary: Arc<dyn KeyValueStore>,
    mirror: Option<Arc<dyn KeyValueStore>>,
    key: String,
    slot: RwLock<Slot>,
    transitions: broadcast::Sender<StoreTransition>,
}

impl SessionStore {
    pub fn new(primary: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        let (transitions, _) = broadcast::channel(32);
        Self {
            primary,
            mirror: None,
            key: format!("{prefix}session"),
            slot: RwLock::new(Slot::default()),
            transitions,
        }
    }

    /// Second store written on every save and read when the primary is empty.
    pub fn with_mirror(mut self, mirror: Arc<dyn KeyValueStore>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreTransition> {
        self.transitions.subscribe()
    }

    /// The active session, unless it has expired.
    pub fn current(&self) -> Option<Session> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .session
            .clone()
            .filter(is_session_valid)
    }

    /// Topic of the held session, expired or not.
    pub fn active_topic(&self) -> Option<String> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .session
            .as_ref()
            .map(|session| session.topic.clone())
    }

    pub fn last_connected_at(&self) -> Option<u64> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).last_connected_at
    }

    pub async fn save_session(&self, session: Session) -> Result<(), ConnectError> {
        if !is_session_valid(&session) {
            return Err(ConnectError::SessionExpired(session.topic));
        }

        let now = epoch_secs();
        let topic = session.topic.clone();
        self.persist(&session, now).await;
        {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.session = Some(session);
            slot.last_connected_at = Some(now);
        }

        info!(topic = %topic, "session saved");
        self.publish(StoreTransition::Saved { topic });
        Ok(())
    }

    /// Reads the persisted session, primary store first. Anything unreadable
    /// or expired is removed from storage and reported as `None`.
    pub async fn load_session(&self) -> Option<Session> {
        let raw = match self.read_raw().await {
            Some(raw) => raw,
            None => return None,
        };

        let persisted = match serde_json::from_str::<PersistedSession>(&raw) {
            Ok(persisted) => persisted,
            Err(err) => {
                self.purge(format!("unreadable session record: {err}")).await;
                return None;
            }
        };

        if !is_session_valid(&persisted.session) {
            self.purge(format!("session {} expired", persisted.session.topic)).await;
            return None;
        }

        let session = persisted.session;
        {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.session = Some(session.clone());
            slot.last_connected_at = Some(persisted.last_connected_at);
        }
        info!(topic = %session.topic, "session restored from storage");
        self.publish(StoreTransition::Restored {
            topic: session.topic.clone(),
        });
        Some(session)
    }

    /// Replaces the namespaces of the active session when `topic` matches it.
    pub async fn update_namespaces(
        &self,
        topic: &str,
        namespaces: BTreeMap<String, Namespace>,
    ) -> Option<Session> {
        let (session, last_connected_at) = {
            let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
            let slot = &mut *guard;
            let session = slot.session.as_mut().filter(|s| s.topic == topic)?;
            session.namespaces = namespaces;
            (session.clone(), slot.last_connected_at.unwrap_or_else(epoch_secs))
        };

        self.persist(&session, last_connected_at).await;
        debug!(topic = %topic, "session namespaces updated");
        self.publish(StoreTransition::Updated {
            topic: topic.to_owned(),
        });
        Some(session)
    }

    /// Removes the session from memory and every store. Safe to repeat.
    pub async fn clear_session(&self) {
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.last_connected_at = None;
            slot.session.take()
        };
        self.remove_persisted().await;

        let topic = previous.map(|session| session.topic);
        if topic.is_some() {
            info!(topic = ?topic, "session cleared");
        }
        self.publish(StoreTransition::Cleared { topic });
    }

    async fn read_raw(&self) -> Option<String> {
        for (name, store) in self.stores() {
            match store.get(&self.key).await {
                Ok(Some(raw)) => return Some(raw),
                Ok(None) => {}
                Err(err) => warn!(store = name, error = %err, "session read failed"),
            }
        }
        None
    }

    async fn persist(&self, session: &Session, last_connected_at: u64) {
        let record = PersistedSession {
            session: session.clone(),
            last_connected_at,
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "session could not be serialized");
                return;
            }
        };

        for (name, store) in self.stores() {
            if let Err(err) = store.set(&self.key, raw.clone()).await {
                warn!(store = name, error = %err, "session write failed");
            }
        }
    }

    async fn remove_persisted(&self) {
        for (name, store) in self.stores() {
            if let Err(err) = store.remove(&self.key).await {
                warn!(store = name, error = %err, "session remove failed");
            }
        }
    }

    async fn purge(&self, reason: String) {
        self.remove_persisted().await;
        warn!(reason = %reason, "stored session purged");
        self.publish(StoreTransition::Purged { reason });
    }

    fn stores(&self) -> Vec<(&'static str, &Arc<dyn KeyValueStore>)> {
        let mut stores = vec![("primary", &self.primary)];
        if let Some(mirror) = &self.mirror {
            stores.push(("mirror", mirror));
        }
        stores
    }

    fn publish(&self, transition: StoreTransition) {
        // No receivers is fine.
        let _ = self.transitions.send(transition);
    }
}
