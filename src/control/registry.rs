//! Process-wide registry of live controls
//!
//! Pipe connections arrive on their own listener and carry only a client
//! identifier; the registry is how they find the owning [`Control`].

use super::{Control, ControlError};
use crate::crypto::ClientId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Cheap cloneable handle to the `client_id -> Control` map
#[derive(Clone, Default)]
pub struct ControlRegistry {
    inner: Arc<RwLock<HashMap<ClientId, Arc<Control>>>>,
}

impl ControlRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a control under its client identifier
    ///
    /// A collision cannot occur for randomly drawn identifiers; if it does,
    /// the handshake that produced it is failed rather than displacing the
    /// live entry.
    pub fn register(&self, control: Arc<Control>) -> Result<(), ControlError> {
        let client_id = control.client_id();
        let mut controls = self.inner.write().unwrap();
        if controls.contains_key(&client_id) {
            warn!(client_id = %client_id, "client id collision on register");
            return Err(ControlError::AlreadyRegistered(client_id));
        }
        controls.insert(client_id, control);
        Ok(())
    }

    /// Remove a control at teardown
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<Control>> {
        let removed = self.inner.write().unwrap().remove(client_id);
        if removed.is_some() {
            debug!(client_id = %client_id, "client unregistered");
        }
        removed
    }

    /// Look up the control owning `client_id`
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Control>> {
        self.inner.read().unwrap().get(client_id).cloned()
    }

    /// Number of live controls
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}
