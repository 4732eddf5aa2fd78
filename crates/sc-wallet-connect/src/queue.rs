use crate::error::ConnectError;
use sc_pairing_client::{PairingClient, RpcRequest};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serializes wallet RPC calls: one in flight, serviced in enqueue order.
///
/// This is the only caller of [`PairingClient::request`]. The queue never
/// retries; a failed entry is reported to its caller and the next one runs.
pub struct RequestQueue {
    client: Arc<dyn PairingClient>,
    // tokio's Mutex hands out the lock in FIFO order.
    gate: Mutex<()>,
    pending: AtomicUsize,
}

impl RequestQueue {
    pub fn new(client: Arc<dyn PairingClient>) -> Self {
        Self {
            client,
            gate: Mutex::new(()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Queued plus running entries.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn add<T, F, Fut>(&self, request_fn: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _pending = PendingGuard(&self.pending);

        let _turn = self.gate.lock().await;
        request_fn().await
    }

    /// Sends one RPC through the queue. The timeout covers only the call
    /// itself, not the wait for earlier entries.
    pub async fn submit(&self, request: RpcRequest, timeout: Duration) -> Result<Value, ConnectError> {
        let client = self.client.clone();
        let method = request.method.clone();

        self.add(|| async move {
            debug!(method = %request.method, topic = %request.topic, "sending wallet request");
            match tokio::time::timeout(timeout, client.request(request)).await {
                Ok(result) => result.map_err(ConnectError::from),
                Err(_) => Err(ConnectError::Timeout {
                    operation: "wallet request",
                    after: timeout,
                }),
            }
        })
        .await
        .inspect_err(|err| warn!(method = %method, error = %err, "wallet request failed"))
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
