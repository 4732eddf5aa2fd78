use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Show/hide instructions for a UI-owned pairing modal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModalSignal {
    Show { uri: String },
    Hide,
}

/// The pairing SDK's own QR modal.
pub trait PairingModal: Send + Sync {
    fn open(&self, uri: &str);
    fn close(&self);
}

/// Link between the connection core and whatever displays the pairing URI.
///
/// The UI reports "closed without connecting" via [`ModalBridge::report_closed`];
/// a pending approval treats that as a user rejection.
pub struct ModalBridge {
    sdk_modal: Option<Arc<dyn PairingModal>>,
    signals: broadcast::Sender<ModalSignal>,
    closed: watch::Sender<u64>,
}

impl Default for ModalBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalBridge {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(16);
        let (closed, _) = watch::channel(0);
        Self {
            sdk_modal: None,
            signals,
            closed,
        }
    }

    pub fn with_sdk_modal(mut self, modal: Arc<dyn PairingModal>) -> Self {
        self.sdk_modal = Some(modal);
        self
    }

    pub fn has_sdk_modal(&self) -> bool {
        self.sdk_modal.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModalSignal> {
        self.signals.subscribe()
    }

    pub fn report_closed(&self) {
        debug!("pairing modal closed by user");
        self.closed.send_modify(|count| *count += 1);
    }

    /// Changes each time the modal is reported closed.
    pub fn closed_watch(&self) -> watch::Receiver<u64> {
        self.closed.subscribe()
    }

    /// Returns `false` when no SDK modal is configured.
    pub(crate) fn open_sdk(&self, uri: &str) -> bool {
        match &self.sdk_modal {
            Some(modal) => {
                modal.open(uri);
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_sdk(&self) -> bool {
        match &self.sdk_modal {
            Some(modal) => {
                modal.close();
                true
            }
            None => false,
        }
    }

    pub(crate) fn signal(&self, signal: ModalSignal) {
        let _ = self.signals.send(signal);
    }
}
