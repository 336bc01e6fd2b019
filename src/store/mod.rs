use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::models::Preferences;

pub mod json_file;
pub mod memory;

pub use json_file::JsonFilePreferences;
pub use memory::MemoryPreferences;

/// Host-side persistence of the preferences record. The bridge is the source of truth:
/// `set_preferences` returns the record as stored.
#[async_trait]
pub trait PreferencesBridge: Send + Sync {
    async fn get_preferences(&self) -> Result<Preferences>;
    async fn set_preferences(&self, prefs: Preferences) -> Result<Preferences>;
}

/// Advisory in-memory copy of the preferences plus the bridge it is persisted through.
#[derive(Clone)]
pub struct PreferencesStore {
    bridge: Arc<dyn PreferencesBridge>,
    current: Arc<Mutex<Preferences>>,
}

impl PreferencesStore {
    pub async fn load(bridge: Arc<dyn PreferencesBridge>) -> Result<Self> {
        let prefs = bridge.get_preferences().await?;
        Ok(Self {
            bridge,
            current: Arc::new(Mutex::new(prefs)),
        })
    }

    pub async fn snapshot(&self) -> Preferences {
        self.current.lock().await.clone()
    }

    /// Read the current copy, apply `mutate`, persist, and adopt what the bridge stored.
    /// Nothing is kept if persisting fails.
    pub async fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Preferences) -> T + Send,
        T: Send,
    {
        let mut guard = self.current.lock().await;
        let mut next = guard.clone();
        let outcome = mutate(&mut next);
        let saved = self.bridge.set_preferences(next).await?;
        *guard = saved;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeployError;

    struct FailingBridge;

    #[async_trait]
    impl PreferencesBridge for FailingBridge {
        async fn get_preferences(&self) -> Result<Preferences> {
            Ok(Preferences::default())
        }

        async fn set_preferences(&self, _prefs: Preferences) -> Result<Preferences> {
            Err(DeployError::Bridge("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn update_persists_through_the_bridge() {
        let bridge = Arc::new(MemoryPreferences::new(Preferences::default()));
        let store = PreferencesStore::load(bridge.clone()).await.expect("load");

        let previous = store
            .update(|prefs| std::mem::replace(&mut prefs.channel, "beta".to_string()))
            .await
            .expect("update");

        assert_eq!(previous, "");
        assert_eq!(store.snapshot().await.channel, "beta");
        assert_eq!(bridge.current().channel, "beta");
        assert_eq!(bridge.write_count(), 1);
    }

    #[tokio::test]
    async fn failed_persist_leaves_memory_untouched() {
        let store = PreferencesStore::load(Arc::new(FailingBridge))
            .await
            .expect("load");
        let result = store
            .update(|prefs| prefs.channel = "beta".to_string())
            .await;

        assert!(matches!(result, Err(DeployError::Bridge(_))));
        assert_eq!(store.snapshot().await.channel, "");
    }
}
