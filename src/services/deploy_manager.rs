use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::DeployTuning;
use crate::errors::{DeployError, Result};
use crate::events::{DeployEvent, EventBus, IntegrityFailureKind};
use crate::models::{
    AppInfo, CheckDeviceRequest, CheckDeviceResponse, CurrentConfig, DeployConfig,
    DeviceDetails, Preferences, SnapshotInfo, SyncOptions, UpdateMethod, UpdateRecord,
    UpdateState,
};
use crate::services::api_client::DeployApi;
use crate::services::cancel_token::CancelToken;
use crate::services::download_manager::{DownloadManager, DownloadOutcome, ProgressFn};
use crate::services::host::HostShell;
use crate::services::integrity_service::IntegrityService;
use crate::services::manifest_service::{ManifestService, MANIFEST_FILE, VERSION_MARKER_FILE};
use crate::store::PreferencesStore;
use crate::utils::file::{CopySource, FileTransport};
use crate::utils::paths;

pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

// Native integration assets refreshed from the bundle when the binary changes under a snapshot.
const NATIVE_DIRECTORIES: &[&str] = &["plugins", "cordova-js-src", "task"];
const NATIVE_FILES: &[&str] = &["cordova.js", "cordova_plugins.js"];
const IOS_NATIVE_FILES: &[&str] = &["wk-plugin.js"];

/// Drives the update lifecycle: check, download, extract, activate, cleanup.
///
/// Cloning is cheap; clones share preferences, collaborators and the event bus.
#[derive(Clone)]
pub struct DeployManager {
    inner: Arc<DeployInner>,
}

struct DeployInner {
    store: PreferencesStore,
    files: Arc<dyn FileTransport>,
    host: Arc<dyn HostShell>,
    api: Arc<dyn DeployApi>,
    app_info: AppInfo,
    manifests: ManifestService,
    integrity: IntegrityService,
    downloads: DownloadManager,
    events: EventBus,
    tuning: DeployTuning,
    last_pause: Mutex<Option<Instant>>,
    background_sync: Mutex<Option<JoinHandle<()>>>,
}

impl DeployManager {
    pub async fn new(
        store: PreferencesStore,
        files: Arc<dyn FileTransport>,
        host: Arc<dyn HostShell>,
        api: Arc<dyn DeployApi>,
        tuning: DeployTuning,
    ) -> Result<Self> {
        let app_info = host.app_info().await?;
        let data_dir = app_info.data_directory.clone();
        let events = EventBus::new();
        let manifests = ManifestService::new(api.clone(), files.clone(), &data_dir, &tuning);
        let integrity = IntegrityService::new(files.clone(), events.clone(), tuning.strict_hash);
        let downloads = DownloadManager::new(
            files.clone(),
            manifests.clone(),
            integrity.clone(),
            events.clone(),
            &data_dir,
            &tuning,
        );

        Ok(Self {
            inner: Arc::new(DeployInner {
                store,
                files,
                host,
                api,
                app_info,
                manifests,
                integrity,
                downloads,
                events,
                tuning,
                last_pause: Mutex::new(None),
                background_sync: Mutex::new(None),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot_dir(&self, version_id: &str) -> String {
        paths::snapshot_dir(&self.inner.app_info.data_directory, version_id)
    }

    async fn is_disabled(&self) -> bool {
        self.inner.store.snapshot().await.disabled
    }

    /// Merges `config` into the preferences. Nothing is written when validation fails.
    pub async fn configure(&self, config: serde_json::Value) -> Result<()> {
        if self.is_disabled().await {
            return Ok(());
        }
        let config: DeployConfig = serde_json::from_value(config)
            .map_err(|err| DeployError::InvalidConfig(err.to_string()))?;
        let method = config
            .update_method
            .as_deref()
            .map(str::parse::<UpdateMethod>)
            .transpose()
            .map_err(DeployError::InvalidConfig)?;
        if let Some(host) = config.host.as_deref() {
            Url::parse(host).map_err(|err| {
                DeployError::InvalidConfig(format!("invalid host '{}': {}", host, err))
            })?;
        }

        let mut merged = self.inner.store.snapshot().await;
        apply_config(&mut merged, &config, method);
        if merged.app_id.trim().is_empty() {
            return Err(DeployError::InvalidConfig("appId is required".to_string()));
        }
        if merged.channel.trim().is_empty() {
            return Err(DeployError::InvalidConfig("channel is required".to_string()));
        }

        self.inner
            .store
            .update(move |prefs| apply_config(prefs, &config, method))
            .await?;
        tracing::info!(
            "configured app {} on channel {}",
            merged.app_id,
            merged.channel
        );
        Ok(())
    }

    pub async fn get_configuration(&self) -> CurrentConfig {
        CurrentConfig::from(&self.inner.store.snapshot().await)
    }

    pub async fn check_for_update(&self) -> Result<CheckDeviceResponse> {
        if self.is_disabled().await {
            return Ok(CheckDeviceResponse::default());
        }
        if !self.inner.host.is_online().await {
            return Err(DeployError::Offline);
        }

        let prefs = self.inner.store.snapshot().await;
        let endpoint = format!(
            "{}/apps/{}/channels/check-device",
            prefs.host.trim_end_matches('/'),
            prefs.app_id
        );
        let request = CheckDeviceRequest {
            channel_name: prefs.channel.clone(),
            app_id: prefs.app_id.clone(),
            device: DeviceDetails {
                binary_version: prefs.binary_version_name.clone(),
                device_id: self.inner.app_info.device.clone(),
                platform: self.inner.app_info.platform.clone(),
                platform_version: self.inner.app_info.platform_version.clone(),
                snapshot: prefs.deployed_version_id().map(str::to_string),
            },
            plugin_version: PLUGIN_VERSION.to_string(),
            manifest: true,
        };

        let response = tokio::time::timeout(
            self.inner.tuning.check_timeout,
            self.inner.api.check_device(&endpoint, &request),
        )
        .await
        .map_err(|_| {
            DeployError::Timeout("Request timed out. The device may be offline.".to_string())
        })??;

        if let (true, true, Some(url), Some(snapshot)) = (
            response.available,
            response.compatible,
            response.url.as_ref(),
            response.snapshot.as_ref(),
        ) {
            let update = UpdateRecord {
                version_id: snapshot.clone(),
                build_id: response.build.clone(),
                channel: prefs.channel.clone(),
                binary_version_name: prefs.binary_version_name.clone(),
                binary_version_code: prefs.binary_version_code.clone(),
                url: url.clone(),
                state: UpdateState::Available,
                last_used: now_rfc3339(),
                ionic_version: None,
            };
            tracing::info!("update {} is available", update.version_id);
            self.inner
                .store
                .update(move |prefs| record_available_update(prefs, update))
                .await?;
        }
        Ok(response)
    }

    /// Fetches the files of an `available` update. Returns false when there was nothing to
    /// download or the token was cancelled.
    pub async fn download_update(
        &self,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> Result<bool> {
        if self.is_disabled().await {
            return Ok(false);
        }
        let prefs = self.inner.store.snapshot().await;
        let Some(update) = prefs
            .available_update
            .clone()
            .filter(|update| update.state == UpdateState::Available)
        else {
            return Ok(false);
        };

        let version_id = update.version_id.clone();
        let base = base_app_source(&prefs, &version_id);
        let (manifest, ()) = tokio::try_join!(
            self.inner.manifests.fetch_remote_manifest(&update.url),
            self.inner.downloads.prepare_snapshot_dir(&version_id, &base),
        )?;

        let diff = self.inner.manifests.diff(&manifest.entries, &version_id).await;
        let outcome = self
            .inner
            .downloads
            .download_files(
                &version_id,
                &manifest.base_url,
                &diff,
                &manifest.entries,
                cancel,
                progress,
            )
            .await?;
        if outcome == DownloadOutcome::Cancelled {
            return Ok(false);
        }

        let ionic_version = self.read_version_marker(&version_id).await;
        tracing::info!("update {} downloaded", version_id);
        self.inner
            .store
            .update(move |prefs| match prefs.available_update.as_mut() {
                Some(update)
                    if update.version_id == version_id
                        && update.state == UpdateState::Available =>
                {
                    update.state = UpdateState::Pending;
                    update.ionic_version = ionic_version;
                    true
                }
                _ => false,
            })
            .await
    }

    /// Marks a `pending` update ready and records it in the catalog.
    pub async fn extract_update(
        &self,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> Result<bool> {
        if self.is_disabled().await || cancel.is_cancelled() {
            return Ok(false);
        }
        let prefs = self.inner.store.snapshot().await;
        if prefs.available_state() != Some(UpdateState::Pending) {
            return Ok(false);
        }
        if let Some(progress) = progress {
            progress(100);
        }

        self.inner
            .store
            .update(|prefs| {
                let Some(update) = prefs.available_update.as_mut() else {
                    return false;
                };
                if update.state != UpdateState::Pending {
                    return false;
                }
                update.state = UpdateState::Ready;
                let record = update.clone();
                prefs.updates.insert(record.version_id.clone(), record);
                true
            })
            .await
    }

    /// Activates a ready update and points the host at the current snapshot.
    /// Returns true when the serving directory was switched.
    pub async fn reload_app(&self, force: bool) -> Result<bool> {
        if self.is_disabled().await {
            self.inner.host.notify_ready();
            return Ok(false);
        }

        let now = now_rfc3339();
        let activated = self
            .inner
            .store
            .update(move |prefs| activate_ready_update(prefs, now))
            .await?;
        if let Some(version_id) = activated {
            tracing::info!("activated update {}", version_id);
        }

        if let Err(err) = self.reconcile_stale_version().await {
            tracing::warn!("could not refresh native assets: {}", err);
        }

        let prefs = self.inner.store.snapshot().await;
        let Some(current) = prefs.deployed_version_id().map(str::to_string) else {
            self.inner.host.notify_ready();
            return Ok(false);
        };

        if !force && self.is_running_version(&current).await {
            tracing::info!("already running version {}", current);
            self.inner
                .store
                .update(|prefs| prefs.current_version_for_app_id = Some(prefs.app_id.clone()))
                .await?;
            self.inner.host.notify_ready();
            self.inner.host.persist_server_base_path().await?;
            self.spawn_cleanup();
            return Ok(false);
        }

        if !prefs.updates.contains_key(&current) {
            tracing::error!("missing version {}", current);
            self.inner.host.notify_ready();
            return Err(DeployError::Inconsistency(format!(
                "current version {} is not in the catalog",
                current
            )));
        }

        let dir = self.snapshot_dir(&current);
        self.inner.host.set_server_base_path(&dir).await?;
        tracing::info!("switched to version {}", current);
        self.spawn_cleanup();
        Ok(true)
    }

    /// Drops every snapshot and serves the bundled assets again.
    pub async fn reset_to_bundle(&self) -> Result<bool> {
        if self.is_disabled().await {
            return Ok(false);
        }
        tracing::info!("resetting to bundled assets");
        self.inner
            .store
            .update(|prefs| {
                prefs.available_update = None;
                prefs.current_version_id = None;
                prefs.current_version_for_app_id = None;
                prefs.current_build_id = None;
                prefs.updates.clear();
            })
            .await?;

        self.inner
            .host
            .set_server_base_path(&self.inner.app_info.bundle_directory)
            .await?;
        self.inner.host.persist_server_base_path().await?;

        let cache_root = paths::snapshot_cache_root(&self.inner.app_info.data_directory);
        if let Err(err) = self.inner.files.remove(&cache_root).await {
            tracing::warn!("could not remove snapshot cache {}: {}", cache_root, err);
        }
        Ok(true)
    }

    /// Check, download and extract in one pass. Returns the current snapshot.
    pub async fn sync(
        &self,
        options: SyncOptions,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> Result<Option<SnapshotInfo>> {
        if self.is_disabled().await {
            return Ok(None);
        }
        let update_method = match options.update_method {
            Some(method) => method,
            None => self.inner.store.snapshot().await.update_method,
        };

        self.check_for_update().await?;

        if self.available_state().await == Some(UpdateState::Available) {
            self.download_update(cancel, progress.clone()).await?;
        }
        if cancel.is_cancelled() {
            tracing::info!("sync cancelled");
            cancel.on_cancel();
            return Ok(None);
        }
        if self.available_state().await == Some(UpdateState::Pending) {
            self.extract_update(cancel, progress).await?;
        }
        if self.available_state().await == Some(UpdateState::Ready)
            && update_method == UpdateMethod::Auto
        {
            self.reload_app(false).await?;
        }

        let prefs = self.inner.store.snapshot().await;
        Ok(prefs.deployed_version_id().map(|version_id| SnapshotInfo {
            version_id: version_id.to_string(),
            build_id: prefs.current_build_id.clone(),
            channel: prefs.channel.clone(),
            binary_version_name: prefs.binary_version_name.clone(),
            binary_version_code: prefs.binary_version_code.clone(),
        }))
    }

    async fn available_state(&self) -> Option<UpdateState> {
        self.inner.store.snapshot().await.available_state()
    }

    pub async fn get_current_version(&self) -> Result<Option<SnapshotInfo>> {
        let prefs = self.inner.store.snapshot().await;
        match prefs.deployed_version_id() {
            Some(version_id) => self.get_version_by_id(version_id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_available_versions(&self) -> Vec<SnapshotInfo> {
        let prefs = self.inner.store.snapshot().await;
        prefs.updates.values().map(SnapshotInfo::from).collect()
    }

    pub async fn get_version_by_id(&self, version_id: &str) -> Result<SnapshotInfo> {
        let prefs = self.inner.store.snapshot().await;
        prefs
            .updates
            .get(version_id)
            .map(SnapshotInfo::from)
            .ok_or_else(|| {
                DeployError::NotFound(format!("No update available with versionId {}", version_id))
            })
    }

    pub async fn delete_version_by_id(&self, version_id: &str) -> Result<bool> {
        if self.is_disabled().await {
            return Ok(true);
        }
        let prefs = self.inner.store.snapshot().await;
        if prefs.current_version_id.as_deref() == Some(version_id) {
            return Err(DeployError::Inconsistency(format!(
                "Can't delete version with id: {} as it is the current version.",
                version_id
            )));
        }

        let removed = version_id.to_string();
        self.inner
            .store
            .update(move |prefs| {
                prefs.updates.remove(&removed);
            })
            .await?;
        self.inner.files.remove(&self.snapshot_dir(version_id)).await?;
        tracing::info!("deleted version {}", version_id);
        Ok(true)
    }

    /// Deletes the least recently used snapshots beyond `maxVersions`.
    /// Returns the deleted version ids.
    pub async fn cleanup_versions(&self) -> Result<Vec<String>> {
        if self.is_disabled().await {
            return Ok(Vec::new());
        }
        let prefs = self.inner.store.snapshot().await;
        let stale = stale_versions(&prefs);
        for version_id in &stale {
            self.delete_version_by_id(version_id).await?;
        }
        if !stale.is_empty() {
            tracing::info!("cleaned up {} old versions", stale.len());
        }
        Ok(stale)
    }

    /// Verifies the core files of the current snapshot. The bundle always passes.
    pub async fn check_core_integrity(&self) -> bool {
        if self.is_disabled().await {
            return true;
        }
        let prefs = self.inner.store.snapshot().await;
        let Some(current) = prefs.deployed_version_id() else {
            return true;
        };

        let manifest = self.inner.manifests.snapshot_manifest(current).await;
        let outcome = if manifest.is_empty() {
            Err(DeployError::integrity(
                MANIFEST_FILE,
                "snapshot manifest is missing or empty",
            ))
        } else {
            self.inner
                .integrity
                .verify_core_files(&manifest, &self.snapshot_dir(current))
                .await
        };

        match outcome {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("core file integrity check failed for {}: {}", current, err);
                self.inner
                    .events
                    .integrity_failed(IntegrityFailureKind::CoreIntegrity, None);
                self.inner
                    .events
                    .emit(DeployEvent::CoreFileIntegrityCheckFailed {});
                false
            }
        }
    }

    /// Startup sequence. Failures are logged; the worst outcome is serving the bundle.
    pub async fn start(&self) {
        if self.is_disabled().await {
            tracing::warn!("live updates are disabled");
            self.inner.host.notify_ready();
            return;
        }

        if !self.check_core_integrity().await {
            tracing::warn!("falling back to bundled assets");
            if let Err(err) = self.reset_to_bundle().await {
                tracing::warn!("reset to bundle failed: {}", err);
            }
            if let Err(err) = self.inner.host.restart_app().await {
                tracing::warn!("restart request failed: {}", err);
            }
            self.inner.host.notify_ready();
            return;
        }

        if let Err(err) = self.reconcile_stale_version().await {
            tracing::warn!("could not refresh native assets: {}", err);
        }

        if !self.inner.host.is_online().await {
            tracing::warn!(
                "device appears to be offline; loading last available version without checking"
            );
            self.reload_logged().await;
            return;
        }

        let background = SyncOptions {
            update_method: Some(UpdateMethod::Background),
        };
        match self.inner.store.snapshot().await.update_method {
            UpdateMethod::Auto => {
                if let Err(err) = self.sync(background, &CancelToken::new(), None).await {
                    tracing::warn!("sync failed, keeping last available version: {}", err);
                }
                self.reload_logged().await;
            }
            UpdateMethod::None => self.reload_logged().await,
            UpdateMethod::Background => {
                self.reload_logged().await;
                self.spawn_background_sync();
            }
        }
    }

    pub fn on_pause(&self) {
        if let Ok(mut guard) = self.inner.last_pause.lock() {
            *guard = Some(Instant::now());
        }
    }

    /// Reruns startup when the app stayed paused longer than `minBackgroundDuration`.
    pub async fn on_resume(&self) -> bool {
        let paused_at = self
            .inner
            .last_pause
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(paused_at) = paused_at else {
            return false;
        };

        let prefs = self.inner.store.snapshot().await;
        if prefs.disabled || prefs.min_background_duration == 0 {
            return false;
        }
        if paused_at.elapsed() <= Duration::from_secs(prefs.min_background_duration) {
            return false;
        }

        tracing::info!("resumed after {:?}, rerunning startup", paused_at.elapsed());
        self.start().await;
        true
    }

    /// Waits for the sync spawned by the last background `start`, if any.
    pub async fn wait_for_background_sync(&self) {
        let handle = self
            .inner
            .background_sync
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!("background sync task failed: {}", err);
            }
        }
    }

    /// Refreshes native assets of a snapshot built for another binary, then stamps the
    /// record with the running binary version. Copy errors are only logged.
    pub async fn reconcile_stale_version(&self) -> Result<bool> {
        let prefs = self.inner.store.snapshot().await;
        let Some(current) = prefs.deployed_version_id() else {
            return Ok(false);
        };
        let Some(record) = prefs.updates.get(current) else {
            return Ok(false);
        };
        if record.built_for(&prefs.binary_version_name, &prefs.binary_version_code) {
            return Ok(false);
        }
        if self.is_running_version(current).await {
            return Ok(false);
        }

        tracing::info!(
            "update {} was built for binary {} ({}), device runs {} ({}); refreshing native assets",
            current,
            record.binary_version_name,
            record.binary_version_code,
            prefs.binary_version_name,
            prefs.binary_version_code
        );
        self.copy_native_assets(&self.snapshot_dir(current)).await;

        let version_id = current.to_string();
        self.inner
            .store
            .update(move |prefs| {
                let name = prefs.binary_version_name.clone();
                let code = prefs.binary_version_code.clone();
                if let Some(record) = prefs.updates.get_mut(&version_id) {
                    record.binary_version_name = name;
                    record.binary_version_code = code;
                }
            })
            .await?;
        Ok(true)
    }

    async fn copy_native_assets(&self, snapshot_dir: &str) {
        let files = &self.inner.files;
        for &name in NATIVE_DIRECTORIES {
            let target = paths::join(&[snapshot_dir, name]);
            if let Err(err) = files.copy(&CopySource::bundle(name), &target).await {
                tracing::warn!("could not refresh {}: {}", target, err);
            }
        }

        let mut names = NATIVE_FILES.to_vec();
        if self.inner.app_info.platform.eq_ignore_ascii_case("ios") {
            names.extend_from_slice(IOS_NATIVE_FILES);
        }
        for name in names {
            let target = paths::join(&[snapshot_dir, name]);
            if let Err(err) = files.remove(&target).await {
                tracing::warn!("could not remove {}: {}", target, err);
                continue;
            }
            if let Err(err) = files.copy(&CopySource::bundle(name), &target).await {
                tracing::warn!("could not refresh {}: {}", target, err);
            }
        }
    }

    async fn is_running_version(&self, version_id: &str) -> bool {
        match self.inner.host.server_base_path().await {
            Ok(path) => Path::new(&path) == Path::new(&self.snapshot_dir(version_id)),
            Err(err) => {
                tracing::warn!("could not read the serving path: {}", err);
                false
            }
        }
    }

    async fn read_version_marker(&self, version_id: &str) -> Option<String> {
        let dir = self.snapshot_dir(version_id);
        let path = paths::join(&[dir.as_str(), VERSION_MARKER_FILE]);
        let contents = self.inner.files.read_text(&path).await.ok()?;
        let marker: serde_json::Value = serde_json::from_str(&contents).ok()?;
        marker
            .get("version")
            .and_then(|version| version.as_str())
            .map(str::to_string)
    }

    async fn reload_logged(&self) {
        if let Err(err) = self.reload_app(false).await {
            tracing::warn!("reload failed: {}", err);
        }
    }

    fn spawn_cleanup(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.cleanup_versions().await {
                tracing::warn!("version cleanup failed: {}", err);
            }
        });
    }

    fn spawn_background_sync(&self) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let options = SyncOptions {
                update_method: Some(UpdateMethod::Background),
            };
            if let Err(err) = manager.sync(options, &CancelToken::new(), None).await {
                tracing::warn!("background sync failed: {}", err);
            }
        });
        if let Ok(mut guard) = self.inner.background_sync.lock() {
            *guard = Some(handle);
        }
    }

    #[cfg(test)]
    fn set_last_pause(&self, at: Instant) {
        if let Ok(mut guard) = self.inner.last_pause.lock() {
            *guard = Some(at);
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn apply_config(prefs: &mut Preferences, config: &DeployConfig, method: Option<UpdateMethod>) {
    if let Some(app_id) = config.app_id.as_ref() {
        prefs.app_id = app_id.clone();
    }
    if let Some(channel) = config.channel.as_ref() {
        prefs.channel = channel.clone();
    }
    if let Some(host) = config.host.as_ref() {
        prefs.host = host.clone();
    }
    if let Some(debug) = config.debug {
        prefs.debug = debug;
    }
    if let Some(method) = method {
        prefs.update_method = method;
    }
    if let Some(max_versions) = config.max_versions {
        prefs.max_versions = max_versions;
    }
    if let Some(duration) = config.min_background_duration {
        prefs.min_background_duration = duration;
    }
}

// A re-check never moves an update of the same snapshot back to `available`.
fn record_available_update(prefs: &mut Preferences, update: UpdateRecord) {
    if let Some(existing) = prefs.available_update.as_ref() {
        if existing.version_id == update.version_id && existing.state > UpdateState::Available {
            tracing::debug!(
                "update {} already {:?}, keeping it",
                existing.version_id,
                existing.state
            );
            return;
        }
    }
    prefs.available_update = Some(update);
}

fn activate_ready_update(prefs: &mut Preferences, now: String) -> Option<String> {
    if prefs.available_state() != Some(UpdateState::Ready) {
        return None;
    }
    let mut update = prefs.available_update.take()?;
    update.last_used = now;
    let version_id = update.version_id.clone();
    prefs.current_version_id = Some(version_id.clone());
    prefs.current_version_for_app_id = Some(prefs.app_id.clone());
    prefs.current_build_id = update.build_id.clone();
    prefs.updates.insert(version_id.clone(), update);
    Some(version_id)
}

/// Where a new snapshot directory is seeded from: the current snapshot of the same app, or
/// the bundle.
fn base_app_source(prefs: &Preferences, version_id: &str) -> CopySource {
    match prefs.deployed_version_id() {
        Some(current)
            if current != version_id
                && prefs.updates.contains_key(current)
                && prefs.current_version_for_app_id.as_deref() == Some(prefs.app_id.as_str()) =>
        {
            CopySource::data(paths::snapshot_relative(current))
        }
        _ => CopySource::bundle(""),
    }
}

fn last_used_at(update: &UpdateRecord) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&update.last_used)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

// The in-flight update counts toward the cap but is never a candidate.
fn stale_versions(prefs: &Preferences) -> Vec<String> {
    let in_flight = prefs
        .available_update
        .as_ref()
        .map(|update| update.version_id.as_str());
    let current = prefs.current_version_id.as_deref();

    let mut candidates: Vec<&UpdateRecord> = prefs
        .updates
        .values()
        .filter(|update| Some(update.version_id.as_str()) != current)
        .filter(|update| Some(update.version_id.as_str()) != in_flight)
        .collect();
    candidates.sort_by(|a, b| last_used_at(b).cmp(&last_used_at(a)));

    let reserved = in_flight
        .filter(|id| Some(*id) != current && prefs.updates.contains_key(*id))
        .map_or(0, |_| 1);
    let keep = prefs.max_versions.saturating_sub(reserved);
    candidates
        .into_iter()
        .skip(keep)
        .map(|update| update.version_id.clone())
        .collect()
}
