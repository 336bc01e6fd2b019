use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{DeployError, Result};
use crate::models::AppInfo;
use crate::utils::file::write_atomic;

/// The native shell hosting the web view.
#[async_trait]
pub trait HostShell: Send + Sync {
    async fn app_info(&self) -> Result<AppInfo>;
    /// Directory the web view is currently served from.
    async fn server_base_path(&self) -> Result<String>;
    async fn set_server_base_path(&self, path: &str) -> Result<()>;
    /// Keep the current serving directory across native restarts.
    async fn persist_server_base_path(&self) -> Result<()>;
    async fn restart_app(&self) -> Result<()>;
    async fn is_online(&self) -> bool;
    /// Tells the shell the update engine is done with startup.
    fn notify_ready(&self);
}

/// In-process host used by the `live-update` binary and by tests.
pub struct LocalHost {
    app_info: AppInfo,
    base_path: Mutex<String>,
    state_file: Option<PathBuf>,
    online: AtomicBool,
    ready_signals: AtomicUsize,
    restarts: AtomicUsize,
}

impl LocalHost {
    pub fn new(app_info: AppInfo) -> Self {
        let base_path = app_info.bundle_directory.clone();
        Self {
            app_info,
            base_path: Mutex::new(base_path),
            state_file: None,
            online: AtomicBool::new(true),
            ready_signals: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    /// Restores the serving path persisted in `state_file`, if any.
    pub async fn with_state_file(app_info: AppInfo, state_file: PathBuf) -> Self {
        let mut host = Self::new(app_info);
        if let Ok(saved) = tokio::fs::read_to_string(&state_file).await {
            let saved = saved.trim();
            if !saved.is_empty() {
                host.base_path = Mutex::new(saved.to_string());
            }
        }
        host.state_file = Some(state_file);
        host
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn ready_signals(&self) -> usize {
        self.ready_signals.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn current_base_path(&self) -> String {
        self.base_path
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostShell for LocalHost {
    async fn app_info(&self) -> Result<AppInfo> {
        Ok(self.app_info.clone())
    }

    async fn server_base_path(&self) -> Result<String> {
        self.base_path
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| DeployError::Bridge("host lock poisoned".to_string()))
    }

    async fn set_server_base_path(&self, path: &str) -> Result<()> {
        let mut guard = self
            .base_path
            .lock()
            .map_err(|_| DeployError::Bridge("host lock poisoned".to_string()))?;
        tracing::info!("serving web assets from {}", path);
        *guard = path.to_string();
        Ok(())
    }

    async fn persist_server_base_path(&self) -> Result<()> {
        let Some(state_file) = self.state_file.as_ref() else {
            return Ok(());
        };
        let current = self.server_base_path().await?;
        write_atomic(state_file, current.as_bytes()).await
    }

    async fn restart_app(&self) -> Result<()> {
        tracing::info!("native restart requested");
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn notify_ready(&self) {
        self.ready_signals.fetch_add(1, Ordering::SeqCst);
    }
}
