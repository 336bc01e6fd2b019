use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::models::Preferences;
use crate::store::PreferencesBridge;
use crate::utils::file::write_atomic;

/// Preferences persisted as one JSON document. A missing file yields `defaults`, and so
/// does an unparseable one after it is moved to `<name>.corrupt`.
pub struct JsonFilePreferences {
    path: PathBuf,
    defaults: Preferences,
    write_lock: Mutex<()>,
}

impl JsonFilePreferences {
    pub fn new(path: PathBuf, defaults: Preferences) -> Self {
        Self {
            path,
            defaults,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PreferencesBridge for JsonFilePreferences {
    async fn get_preferences(&self) -> Result<Preferences> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(prefs) => Ok(prefs),
                Err(err) => {
                    let aside = corrupt_path(&self.path);
                    tracing::warn!(
                        "preferences at {:?} are unreadable ({}), moving them to {:?}",
                        self.path,
                        err,
                        aside
                    );
                    tokio::fs::rename(&self.path, &aside).await?;
                    Ok(self.defaults.clone())
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(self.defaults.clone()),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_preferences(&self, prefs: Preferences) -> Result<Preferences> {
        let _guard = self.write_lock.lock().await;
        let payload = serde_json::to_vec_pretty(&prefs)?;
        write_atomic(&self.path, &payload).await?;
        Ok(prefs)
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn missing_file_yields_defaults_and_writes_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("live-update-prefs-{}", Uuid::new_v4()))
            .join("preferences.json");
        let defaults = Preferences {
            app_id: "A".to_string(),
            ..Preferences::default()
        };
        let bridge = JsonFilePreferences::new(path.clone(), defaults.clone());

        assert_eq!(bridge.get_preferences().await.expect("defaults"), defaults);

        let mut next = defaults.clone();
        next.current_version_id = Some("v2".to_string());
        bridge.set_preferences(next.clone()).await.expect("persist");

        assert!(path.exists());
        assert_eq!(bridge.get_preferences().await.expect("reload"), next);
    }

    #[tokio::test]
    async fn torn_file_is_set_aside_and_defaults_are_used() {
        let dir = std::env::temp_dir().join(format!("live-update-prefs-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("preferences.json");
        std::fs::write(&path, r#"{"appId": "A", "channel"#).expect("write torn file");
        let defaults = Preferences {
            app_id: "fallback".to_string(),
            ..Preferences::default()
        };
        let bridge = JsonFilePreferences::new(path.clone(), defaults.clone());

        assert_eq!(bridge.get_preferences().await.expect("defaults"), defaults);
        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(dir.join("preferences.json.corrupt")).expect("kept aside"),
            r#"{"appId": "A", "channel"#
        );

        bridge.set_preferences(defaults.clone()).await.expect("persist");
        assert_eq!(bridge.get_preferences().await.expect("reload"), defaults);
    }
}
