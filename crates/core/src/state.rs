//! Immutable configuration snapshots for long-lived components.
//!
//! A component starts `Unconfigured`; configuring it publishes an immutable
//! snapshot behind an `Arc`. Readers clone the `Arc` and keep a consistent
//! view for the whole operation even if a new snapshot is swapped in
//! concurrently. Snapshots are never mutated in place.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{CoreError, Result};

/// Configuration state of a component.
#[derive(Debug)]
pub enum ConfigState<T> {
    /// No configuration has been applied yet
    Unconfigured,
    /// Configured with an immutable snapshot
    Configured(Arc<T>),
}

impl<T> Clone for ConfigState<T> {
    fn clone(&self) -> Self {
        match self {
            ConfigState::Unconfigured => ConfigState::Unconfigured,
            ConfigState::Configured(snapshot) => ConfigState::Configured(Arc::clone(snapshot)),
        }
    }
}

/// Atomically swappable `{Unconfigured, Configured}` snapshot holder.
#[derive(Debug)]
pub struct ConfigCell<T> {
    component: &'static str,
    state: RwLock<ConfigState<T>>,
}

impl<T> ConfigCell<T> {
    /// Create an unconfigured cell. `component` names the owner in errors.
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            state: RwLock::new(ConfigState::Unconfigured),
        }
    }

    /// Create a cell that is already configured.
    pub fn configured(component: &'static str, snapshot: T) -> Self {
        Self {
            component,
            state: RwLock::new(ConfigState::Configured(Arc::new(snapshot))),
        }
    }

    /// Publish a new snapshot, returning the one it replaced.
    pub fn configure(&self, snapshot: T) -> Option<Arc<T>> {
        self.store(Arc::new(snapshot))
    }

    /// Publish an already shared snapshot, returning the one it replaced.
    pub fn store(&self, snapshot: Arc<T>) -> Option<Arc<T>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, ConfigState::Configured(snapshot)) {
            ConfigState::Configured(previous) => Some(previous),
            ConfigState::Unconfigured => None,
        }
    }

    /// Current snapshot, or a precondition error while unconfigured.
    pub fn load(&self) -> Result<Arc<T>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ConfigState::Configured(snapshot) => Ok(Arc::clone(snapshot)),
            ConfigState::Unconfigured => Err(CoreError::Unconfigured(self.component)),
        }
    }

    pub fn state(&self) -> ConfigState<T> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.state(), ConfigState::Configured(_))
    }
}
