use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHIA_NAMESPACE: &str = "chia";
pub const CHIA_MAINNET: &str = "chia:mainnet";
pub const CHIA_TESTNET: &str = "chia:testnet";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChainId(pub String);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequiredNamespace {
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One pairing between the dApp and a wallet.
///
/// `expiry` is absolute epoch seconds. Accounts inside each namespace follow
/// `<namespace>:<network>:<account>`, for Sage the account is the wallet
/// fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub topic: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, Namespace>,
    pub expiry: u64,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerMetadata>,
}

impl Session {
    pub fn is_expired_at(&self, now_epoch_secs: u64) -> bool {
        self.expiry <= now_epoch_secs
    }

    pub fn chia_accounts(&self) -> &[String] {
        self.namespaces
            .get(CHIA_NAMESPACE)
            .map(|ns| ns.accounts.as_slice())
            .unwrap_or_default()
    }

    /// Account identifiers with the `chia:<network>:` prefix stripped.
    pub fn account_ids(&self) -> Vec<String> {
        self.chia_accounts()
            .iter()
            .filter_map(|account| split_account(account).map(|(_, id)| id.to_owned()))
            .collect()
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.chia_accounts()
            .iter()
            .find_map(|account| split_account(account).map(|(chain, _)| ChainId(chain.to_owned())))
    }

    pub fn fingerprint(&self) -> Option<u32> {
        self.account_ids().first().and_then(|id| id.parse().ok())
    }
}

fn split_account(account: &str) -> Option<(&str, &str)> {
    let (chain, id) = account.rsplit_once(':')?;
    if !chain.contains(':') || id.is_empty() {
        return None;
    }
    Some((chain, id))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Healing,
    Error,
}

/// Snapshot handed to UI layers. Derived, never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_healing: bool,
    pub accounts: Vec<String>,
    pub chain_id: Option<String>,
    pub error: Option<String>,
    pub connection_attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WalletMethod {
    #[serde(rename = "chia_getAddress")]
    GetAddress,
    #[serde(rename = "chip0002_getAssetBalance")]
    GetAssetBalance,
    #[serde(rename = "chip0002_getPublicKeys")]
    GetPublicKeys,
    #[serde(rename = "chia_signMessageByAddress")]
    SignMessage,
    #[serde(rename = "chia_send")]
    SendTransaction,
    #[serde(rename = "chia_createOffer")]
    CreateOffer,
    #[serde(rename = "chia_takeOffer")]
    TakeOffer,
    #[serde(rename = "chia_cancelOffer")]
    CancelOffer,
    #[serde(rename = "chip0002_signCoinSpends")]
    SignCoinSpends,
}

impl WalletMethod {
    pub const ALL: [WalletMethod; 9] = [
        WalletMethod::GetAddress,
        WalletMethod::GetAssetBalance,
        WalletMethod::GetPublicKeys,
        WalletMethod::SignMessage,
        WalletMethod::SendTransaction,
        WalletMethod::CreateOffer,
        WalletMethod::TakeOffer,
        WalletMethod::CancelOffer,
        WalletMethod::SignCoinSpends,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WalletMethod::GetAddress => "chia_getAddress",
            WalletMethod::GetAssetBalance => "chip0002_getAssetBalance",
            WalletMethod::GetPublicKeys => "chip0002_getPublicKeys",
            WalletMethod::SignMessage => "chia_signMessageByAddress",
            WalletMethod::SendTransaction => "chia_send",
            WalletMethod::CreateOffer => "chia_createOffer",
            WalletMethod::TakeOffer => "chia_takeOffer",
            WalletMethod::CancelOffer => "chia_cancelOffer",
            WalletMethod::SignCoinSpends => "chip0002_signCoinSpends",
        }
    }
}

// ── Wallet command payloads ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetAddressResponse {
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAssetBalanceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub confirmed: String,
    pub spendable: String,
    #[serde(default)]
    pub spendable_coin_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPublicKeysRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignMessageRequest {
    pub message: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageResponse {
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTransactionRequest {
    pub address: String,
    pub amount: u64,
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memos: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionResponse {
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// An asset leg of an offer. An empty `asset_id` is the native asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferAsset {
    #[serde(default)]
    pub asset_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOfferRequest {
    pub offer_assets: Vec<OfferAsset>,
    pub request_assets: Vec<OfferAsset>,
    pub fee: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateOfferResponse {
    pub offer: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeOfferRequest {
    pub offer: String,
    pub fee: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TakeOfferResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOfferRequest {
    pub id: String,
    pub fee: u64,
}

/// Response body for commands whose only result is completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledged {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Coin {
    pub parent_coin_info: String,
    pub puzzle_hash: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CoinSpend {
    pub coin: Coin,
    pub puzzle_reveal: String,
    pub solution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCoinSpendsRequest {
    pub coin_spends: Vec<CoinSpend>,
    #[serde(default)]
    pub partial_sign: bool,
}

/// `{success, data, error}` envelope returned by the typed wallet helpers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.error.unwrap_or_else(|| "unknown wallet error".to_owned())),
        }
    }
}
