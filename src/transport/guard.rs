//! Immutable settings guard.
//!
//! The first handler registered for a pool key fixes that key's pooling
//! settings. Later registrations must match them exactly; a mismatch is a
//! configuration error and is never resolved by picking one side.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::Result;

use super::identity::PoolKey;
use super::settings::PoolingSettings;

// ============================================================================
// SettingsGuard
// ============================================================================

/// Registry of the pooling settings first established per key.
#[derive(Debug, Default)]
pub struct SettingsGuard {
    established: Mutex<FxHashMap<PoolKey, PoolingSettings>>,
}

impl SettingsGuard {
    /// Creates an empty guard.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `settings` for `key`, or checks them against the settings
    /// already registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) with "cannot be
    /// modified from the initial settings" if they differ.
    pub fn register(&self, key: &PoolKey, settings: &PoolingSettings) -> Result<()> {
        let mut established = self.established.lock();
        match established.get(key) {
            Some(initial) => {
                if let Err(e) = initial.ensure_matches(settings) {
                    warn!(%key, error = %e, "Rejected conflicting pooling settings");
                    return Err(e);
                }
                Ok(())
            }
            None => {
                debug!(%key, max_pool_size = settings.max_pool_size, "Pooling settings established");
                established.insert(key.clone(), *settings);
                Ok(())
            }
        }
    }

    /// Returns the settings registered for `key`.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &PoolKey) -> Option<PoolingSettings> {
        self.established.lock().get(key).copied()
    }

    /// Forgets every registration.
    pub fn clear(&self) {
        self.established.lock().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
