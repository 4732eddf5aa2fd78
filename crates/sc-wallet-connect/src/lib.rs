//! SageConnect wallet connection core.
//!
//! Establishes, persists, heals and serializes requests over a long-lived
//! pairing session between a dApp and a Chia wallet. The relay transport is
//! supplied through [`sc_pairing_client::PairingClient`]; everything else
//! lives here, one concern per module.

pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod health;
pub mod listeners;
pub mod modal;
pub mod platform;
pub mod queue;
pub mod reconnect;
pub mod retry;
pub mod session_store;
pub mod state;

pub use config::{ConnectConfig, Environment, PlatformKind};
pub use connector::{WalletConnector, WalletConnectorBuilder};
pub use dispatcher::CommandDispatcher;
pub use error::{ConnectError, ErrorClass};
pub use events::{ConnectorCallback, ConnectorEvent, ConnectorEventKind, EventBus};
pub use health::{HealthConfig, HealthMonitor};
pub use listeners::ListenerRegistry;
pub use modal::{ModalBridge, ModalSignal, PairingModal};
pub use platform::{ApprovalFlow, ConstrainedPlatform, DefaultPlatform, PlatformAdapter, select_platform};
pub use queue::RequestQueue;
pub use reconnect::{ReconnectStats, ReconnectionController, RetryFailure};
pub use retry::{Jitter, RetryPolicy};
pub use session_store::{SessionStore, StoreTransition, is_session_valid};
pub use state::ConnectionStateMachine;
