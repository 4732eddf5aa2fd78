use crate::config::{ConnectConfig, PlatformKind};
use crate::modal::{ModalBridge, ModalSignal};
use crate::retry::{Jitter, RetryPolicy};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sc_storage::{InMemoryStore, KeyValueStore};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalFlow {
    /// Open the pairing SDK's modal and await approval.
    SdkModal,
    /// Broadcast show/hide signals for a UI-owned modal.
    EventDriven,
}

/// Environment-specific behavior, selected once at startup.
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn retry_policy(&self) -> RetryPolicy;

    fn approval_flow(&self) -> ApprovalFlow;

    fn jitter(&self) -> Jitter {
        Jitter::None
    }

    fn request_timeout(&self, config: &ConnectConfig) -> Duration {
        config.base_request_timeout()
    }

    fn probe_timeout(&self, config: &ConnectConfig) -> Duration {
        config.probe_timeout
    }

    /// Extra store the session is persisted to.
    fn session_mirror(&self) -> Option<Arc<dyn KeyValueStore>> {
        None
    }

    fn install_error_trap(&self) {}

    fn spawn(&self, _name: &'static str, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        tokio::spawn(task)
    }

    fn present_pairing(&self, modal: &ModalBridge, uri: &str) {
        let opened = match self.approval_flow() {
            ApprovalFlow::SdkModal => modal.open_sdk(uri),
            ApprovalFlow::EventDriven => false,
        };
        if !opened {
            modal.signal(ModalSignal::Show { uri: uri.to_owned() });
        }
    }

    fn dismiss_pairing(&self, modal: &ModalBridge) {
        let closed = match self.approval_flow() {
            ApprovalFlow::SdkModal => modal.close_sdk(),
            ApprovalFlow::EventDriven => false,
        };
        if !closed {
            modal.signal(ModalSignal::Hide);
        }
    }
}

#[derive(Debug, Default)]
pub struct DefaultPlatform;

impl PlatformAdapter for DefaultPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Default
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn approval_flow(&self) -> ApprovalFlow {
        ApprovalFlow::SdkModal
    }
}

/// Embedded mobile browsers and installed web apps.
///
/// Backgrounding can evict in-memory state and kill the page on an
/// uncaught error, so this platform retries longer, waits longer, mirrors
/// the session into an app-switch-resilient store and traps panics in
/// background tasks.
pub struct ConstrainedPlatform {
    mirror: Arc<dyn KeyValueStore>,
}

impl ConstrainedPlatform {
    pub fn new(mirror: Arc<dyn KeyValueStore>) -> Self {
        Self { mirror }
    }
}

static ERROR_TRAP: Once = Once::new();

impl PlatformAdapter for ConstrainedPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Constrained
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::constrained()
    }

    fn approval_flow(&self) -> ApprovalFlow {
        ApprovalFlow::EventDriven
    }

    fn jitter(&self) -> Jitter {
        Jitter::Proportional(0.2)
    }

    fn request_timeout(&self, config: &ConnectConfig) -> Duration {
        config.base_request_timeout() * 2
    }

    fn probe_timeout(&self, config: &ConnectConfig) -> Duration {
        config.probe_timeout * 2
    }

    fn session_mirror(&self) -> Option<Arc<dyn KeyValueStore>> {
        Some(self.mirror.clone())
    }

    fn install_error_trap(&self) {
        ERROR_TRAP.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}", l.file(), l.line()))
                    .unwrap_or_default();
                error!(
                    panic = %panic_message(info.payload()),
                    location = %location,
                    "uncaught panic trapped"
                );
                previous(info);
            }));
        });
    }

    fn spawn(&self, name: &'static str, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
                error!(task = name, panic = %panic_message(payload.as_ref()), "background task panicked");
            }
        })
    }
}

/// Picks the adapter for `kind`. A constrained platform without a mirror
/// store gets an in-memory one.
pub fn select_platform(kind: PlatformKind, mirror: Option<Arc<dyn KeyValueStore>>) -> Arc<dyn PlatformAdapter> {
    match kind {
        PlatformKind::Default => Arc::new(DefaultPlatform),
        PlatformKind::Constrained => {
            let mirror = mirror.unwrap_or_else(|| {
                warn!("no app-switch store supplied, mirroring the session in memory");
                let fallback: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::default());
                fallback
            });
            Arc::new(ConstrainedPlatform::new(mirror))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
