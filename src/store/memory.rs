use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{DeployError, Result};
use crate::models::Preferences;
use crate::store::PreferencesBridge;

/// Preferences held in process memory. Counts writes so callers can observe persistence.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    prefs: Mutex<Preferences>,
    writes: AtomicUsize,
}

impl MemoryPreferences {
    pub fn new(prefs: Preferences) -> Self {
        Self {
            prefs: Mutex::new(prefs),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Preferences {
        self.prefs
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreferencesBridge for MemoryPreferences {
    async fn get_preferences(&self) -> Result<Preferences> {
        self.prefs
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| DeployError::Bridge("preferences lock poisoned".to_string()))
    }

    async fn set_preferences(&self, prefs: Preferences) -> Result<Preferences> {
        let mut guard = self
            .prefs
            .lock()
            .map_err(|_| DeployError::Bridge("preferences lock poisoned".to_string()))?;
        *guard = prefs.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(prefs)
    }
}
