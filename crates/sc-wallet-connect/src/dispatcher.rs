use crate::error::{ConnectError, ErrorClass};
use crate::queue::RequestQueue;
use crate::session_store::SessionStore;
use sc_api_types::{
    Acknowledged, AssetBalance, CancelOfferRequest, ChainId, CommandResult, CreateOfferRequest,
    CreateOfferResponse, GetAddressResponse, GetAssetBalanceRequest, GetPublicKeysRequest,
    SendTransactionRequest, SendTransactionResponse, SignCoinSpendsRequest, SignMessageRequest,
    SignMessageResponse, TakeOfferRequest, TakeOfferResponse, WalletMethod,
};
use sc_pairing_client::RpcRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maps wallet operations onto RPC calls against the active session.
pub struct CommandDispatcher {
    queue: Arc<RequestQueue>,
    store: Arc<SessionStore>,
    default_chain: ChainId,
    request_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        store: Arc<SessionStore>,
        default_chain: ChainId,
        request_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            default_chain,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Sends `method` with the wallet fingerprint merged into `params` and
    /// returns the unwrapped `data` of the response.
    ///
    /// Fails with `NoSession` when no valid session exists, and with
    /// `Wallet` when the wallet answers with an `error` field.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ConnectError> {
        let session = self.store.current().ok_or(ConnectError::NoSession)?;
        let params = with_identity(params, session.fingerprint())?;
        let chain_id = session.chain_id().unwrap_or_else(|| self.default_chain.clone());

        let request = RpcRequest {
            topic: session.topic,
            chain_id,
            method: method.to_owned(),
            params,
        };

        let raw = self.queue.submit(request, self.request_timeout).await?;
        let data = unwrap_response(raw)?;
        serde_json::from_value(data).map_err(|err| ConnectError::InvalidResponse(format!("{method}: {err}")))
    }

    /// Runs a typed command. Transport, timeout and wallet failures come back
    /// as `CommandResult::failure`; only caller errors are `Err`.
    pub async fn command<P, T>(&self, method: WalletMethod, params: &P) -> Result<CommandResult<T>, ConnectError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|err| ConnectError::InvalidRequest(err.to_string()))?;
        match self.request(method.as_str(), params).await {
            Ok(data) => Ok(CommandResult::ok(data)),
            Err(err) if err.class() == ErrorClass::Contract => Err(err),
            Err(err) => {
                debug!(method = method.as_str(), error = %err, "wallet command failed");
                Ok(CommandResult::failure(err.to_string()))
            }
        }
    }

    pub async fn get_address(&self) -> Result<CommandResult<GetAddressResponse>, ConnectError> {
        self.command(WalletMethod::GetAddress, &Map::new()).await
    }

    /// Balance of `asset_id`, or of the native asset when `None`.
    pub async fn get_balance(&self, asset_id: Option<String>) -> Result<CommandResult<AssetBalance>, ConnectError> {
        self.command(WalletMethod::GetAssetBalance, &GetAssetBalanceRequest { asset_id })
            .await
    }

    pub async fn get_public_keys(
        &self,
        request: &GetPublicKeysRequest,
    ) -> Result<CommandResult<Vec<String>>, ConnectError> {
        self.command(WalletMethod::GetPublicKeys, request).await
    }

    pub async fn sign_message(
        &self,
        request: &SignMessageRequest,
    ) -> Result<CommandResult<SignMessageResponse>, ConnectError> {
        self.command(WalletMethod::SignMessage, request).await
    }

    pub async fn send_transaction(
        &self,
        request: &SendTransactionRequest,
    ) -> Result<CommandResult<SendTransactionResponse>, ConnectError> {
        self.command(WalletMethod::SendTransaction, request).await
    }

    pub async fn create_offer(
        &self,
        request: &CreateOfferRequest,
    ) -> Result<CommandResult<CreateOfferResponse>, ConnectError> {
        self.command(WalletMethod::CreateOffer, request).await
    }

    pub async fn take_offer(&self, request: &TakeOfferRequest) -> Result<CommandResult<TakeOfferResponse>, ConnectError> {
        self.command(WalletMethod::TakeOffer, request).await
    }

    pub async fn cancel_offer(&self, request: &CancelOfferRequest) -> Result<CommandResult<Acknowledged>, ConnectError> {
        self.command(WalletMethod::CancelOffer, request).await
    }

    /// Returns the aggregated signature.
    pub async fn sign_coin_spends(&self, request: &SignCoinSpendsRequest) -> Result<CommandResult<String>, ConnectError> {
        self.command(WalletMethod::SignCoinSpends, request).await
    }
}

/// Adds `fingerprint` to object params unless the caller already set one.
fn with_identity(params: Value, fingerprint: Option<u32>) -> Result<Value, ConnectError> {
    let mut object = match params {
        Value::Null => Map::new(),
        Value::Object(object) => object,
        other => {
            return Err(ConnectError::InvalidRequest(format!(
                "params must be a JSON object, got {other}"
            )));
        }
    };
    if let Some(fingerprint) = fingerprint {
        object
            .entry("fingerprint")
            .or_insert_with(|| Value::from(fingerprint));
    }
    Ok(Value::Object(object))
}

/// `{"error": ..}` is a wallet failure even when the transport succeeded;
/// `{"data": ..}` is unwrapped.
fn unwrap_response(raw: Value) -> Result<Value, ConnectError> {
    let mut object = match raw {
        Value::Object(object) => object,
        other => return Ok(empty_if_null(other)),
    };

    match object.remove("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => return Err(ConnectError::Wallet(message)),
        Some(Value::Object(detail)) => {
            let message = detail
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(detail.clone()).to_string());
            return Err(ConnectError::Wallet(message));
        }
        Some(other) => return Err(ConnectError::Wallet(other.to_string())),
    }

    match object.remove("data") {
        Some(data) => Ok(empty_if_null(data)),
        None => Ok(Value::Object(object)),
    }
}

fn empty_if_null(value: Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::epoch_secs;
    use sc_api_types::{CHIA_NAMESPACE, Namespace, Session};
    use sc_pairing_loopback::{LoopbackClient, LoopbackConfig};
    use sc_storage::InMemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn session() -> Session {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(
            CHIA_NAMESPACE.to_owned(),
            Namespace {
                accounts: vec!["chia:mainnet:1234567".to_owned()],
                ..Namespace::default()
            },
        );
        Session {
            topic: "topic-1".to_owned(),
            namespaces,
            expiry: epoch_secs() + 3600,
            acknowledged: true,
            peer: None,
        }
    }

    async fn dispatcher(client: Arc<LoopbackClient>, with_session: bool) -> CommandDispatcher {
        let store = Arc::new(SessionStore::new(Arc::new(InMemoryStore::default()), "t."));
        if with_session {
            let session = session();
            client.insert_session(session.clone());
            store.save_session(session).await.unwrap();
        }
        CommandDispatcher::new(
            Arc::new(RequestQueue::new(client)),
            store,
            ChainId("chia:mainnet".to_owned()),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn identity_is_merged_without_overwriting() {
        let merged = with_identity(Value::Null, Some(42)).unwrap();
        assert_eq!(merged, json!({ "fingerprint": 42 }));

        let explicit = with_identity(json!({ "fingerprint": 7, "fee": 1 }), Some(42)).unwrap();
        assert_eq!(explicit, json!({ "fingerprint": 7, "fee": 1 }));

        assert!(with_identity(json!([1, 2]), Some(42)).is_err());
    }

    #[test]
    fn error_field_wins_over_transport_success() {
        assert_eq!(
            unwrap_response(json!({ "error": "Wallet is locked" })),
            Err(ConnectError::Wallet("Wallet is locked".to_owned()))
        );
        assert_eq!(
            unwrap_response(json!({ "error": { "code": 4001, "message": "Rejected" } })),
            Err(ConnectError::Wallet("Rejected".to_owned()))
        );
        assert_eq!(unwrap_response(json!({ "data": { "id": "x" } })), Ok(json!({ "id": "x" })));
        assert_eq!(unwrap_response(json!({ "data": null })), Ok(json!({})));
        assert_eq!(unwrap_response(json!({ "id": "y" })), Ok(json!({ "id": "y" })));
    }

    #[tokio::test]
    async fn requests_carry_topic_chain_and_fingerprint() {
        let client = Arc::new(LoopbackClient::default());
        client.set_responder(Arc::new(|_: &RpcRequest| Ok(json!({ "data": { "address": "xch1abc" } }))));
        let dispatcher = dispatcher(client.clone(), true).await;

        let result = dispatcher.get_address().await.unwrap();
        assert_eq!(result.into_result().unwrap().address, "xch1abc");

        let sent = client.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "topic-1");
        assert_eq!(sent[0].chain_id, ChainId("chia:mainnet".to_owned()));
        assert_eq!(sent[0].method, "chia_getAddress");
        assert_eq!(sent[0].params, json!({ "fingerprint": 1234567 }));
    }

    #[tokio::test]
    async fn wallet_error_becomes_failed_result() {
        let client = Arc::new(LoopbackClient::default());
        client.set_responder(Arc::new(|_: &RpcRequest| Ok(json!({ "error": { "message": "Insufficient funds" } }))));
        let dispatcher = dispatcher(client, true).await;

        let request = TakeOfferRequest {
            offer: "offer1...".to_owned(),
            fee: 0,
        };
        let result = dispatcher.take_offer(&request).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("wallet error: Insufficient funds"));
    }

    #[tokio::test]
    async fn missing_session_is_a_caller_error() {
        let dispatcher = dispatcher(Arc::new(LoopbackClient::default()), false).await;
        assert_eq!(dispatcher.get_balance(None).await, Err(ConnectError::NoSession));
        assert_eq!(
            dispatcher.request::<Value>("chia_getAddress", Value::Null).await,
            Err(ConnectError::NoSession)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_wallet_reports_timeout_failure() {
        let client = Arc::new(LoopbackClient::new(LoopbackConfig {
            request_latency: Duration::from_secs(120),
            ..LoopbackConfig::default()
        }));
        let dispatcher = dispatcher(client, true).await;

        let result = dispatcher.get_balance(Some("a628c1c2".to_owned())).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("slow to respond"));
    }
}
