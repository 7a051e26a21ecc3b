//! Reset capabilities for evaluated identities.

use std::sync::Arc;

use tracing::{debug, warn};

use super::identity::IdentityKey;
use super::store::{AttemptStore, StoreError};

/// Clears the attempt record of one identity.
///
/// Handed out with every evaluation so a caller can forget an identity's
/// attempts, typically after a successful login.
#[derive(Clone)]
pub struct ResetHandle {
    store: Arc<dyn AttemptStore>,
    key: IdentityKey,
}

impl ResetHandle {
    /// A handle that resets `key` in `store`.
    pub fn new(store: Arc<dyn AttemptStore>, key: IdentityKey) -> Self {
        Self { store, key }
    }

    /// The identity this handle clears.
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        debug!(key = %self.key, "Resetting attempt record");
        self.store.reset(self.key.as_str()).await
    }
}

impl std::fmt::Debug for ResetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetHandle").field("key", &self.key).finish()
    }
}

/// Reset handles gathered while handling one request, cleared together.
///
/// When several limiters cover the same request, collect each evaluation's
/// handle here and call [`ResetChain::reset_all`] once.
#[derive(Debug, Clone, Default)]
pub struct ResetChain {
    handles: Vec<ResetHandle>,
}

impl ResetChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ResetHandle) {
        self.handles.push(handle);
    }

    /// Append `handle` if present.
    pub fn extend_from(&mut self, handle: Option<&ResetHandle>) {
        if let Some(handle) = handle {
            self.push(handle.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Run every reset in the order the handles were added.
    ///
    /// A failing reset does not stop later ones; the first error is returned.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for handle in &self.handles {
            if let Err(e) = handle.reset().await {
                warn!(key = %handle.key(), error = %e, "Reset failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
