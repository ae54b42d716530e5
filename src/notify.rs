//! Status callbacks surfaced to the UI layer.
//!
//! `Callbacks` is a capability set of shared function references supplied at
//! construction. Anything left unset falls back to a `tracing` log line.

use std::fmt;
use std::sync::Arc;

use crate::errors::DraftError;
use crate::state::SaveStatus;
use crate::transport::SaveReceipt;

type SuccessFn = Arc<dyn Fn(&SaveReceipt) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&DraftError) + Send + Sync>;
type SignalFn = Arc<dyn Fn() + Send + Sync>;
type StatusFn = Arc<dyn Fn(SaveStatus) + Send + Sync>;

/// Notification hooks for one agent.
#[derive(Clone)]
pub struct Callbacks {
    on_save_success: SuccessFn,
    on_save_error: ErrorFn,
    on_offline: SignalFn,
    on_online: SignalFn,
    on_status: StatusFn,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_save_success: Arc::new(|receipt: &SaveReceipt| match receipt.version {
                Some(version) => tracing::info!(version, "draft saved"),
                None => tracing::info!("draft saved"),
            }),
            on_save_error: Arc::new(|error: &DraftError| {
                tracing::error!(error = %error, "draft could not be saved; changes kept locally")
            }),
            on_offline: Arc::new(|| tracing::warn!("offline; changes will be saved when back online")),
            on_online: Arc::new(|| tracing::info!("back online")),
            on_status: Arc::new(|status: SaveStatus| tracing::debug!(%status, "autosave status")),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

impl Callbacks {
    pub fn with_on_save_success(mut self, f: impl Fn(&SaveReceipt) + Send + Sync + 'static) -> Self {
        self.on_save_success = Arc::new(f);
        self
    }

    pub fn with_on_save_error(mut self, f: impl Fn(&DraftError) + Send + Sync + 'static) -> Self {
        self.on_save_error = Arc::new(f);
        self
    }

    pub fn with_on_offline(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_offline = Arc::new(f);
        self
    }

    pub fn with_on_online(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_online = Arc::new(f);
        self
    }

    pub fn with_on_status(mut self, f: impl Fn(SaveStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Arc::new(f);
        self
    }

    pub(crate) fn save_success(&self, receipt: &SaveReceipt) {
        (self.on_save_success)(receipt)
    }

    pub(crate) fn save_error(&self, error: &DraftError) {
        (self.on_save_error)(error)
    }

    pub(crate) fn offline(&self) {
        (self.on_offline)()
    }

    pub(crate) fn online(&self) {
        (self.on_online)()
    }

    pub(crate) fn status(&self, status: SaveStatus) {
        (self.on_status)(status)
    }
}
