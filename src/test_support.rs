//! Fakes for the network side of the engine, shared by the inline test modules.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::DeployTuning;
use crate::errors::{DeployError, Result};
use crate::models::{
    AppInfo, CheckDeviceRequest, CheckDeviceResponse, ManifestEntry, Preferences,
};
use crate::services::api_client::{DeployApi, RemoteManifest};
use crate::services::deploy_manager::DeployManager;
use crate::services::host::LocalHost;
use crate::store::{MemoryPreferences, PreferencesStore};
use crate::utils::crypto::{compute_integrity, HashAlgorithm};
use crate::utils::file::{CopySource, FileTransport, LocalFileTransport};

pub fn temp_root() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("live-update-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp root");
    dir
}

/// Manifest entries with matching sha256 digests plus the bodies to serve for them.
pub fn manifest_for(files: &[(&str, usize)]) -> (Vec<ManifestEntry>, Vec<(String, Vec<u8>)>) {
    let mut entries = Vec::new();
    let mut bodies = Vec::new();
    for (index, (href, size)) in files.iter().enumerate() {
        let body: Vec<u8> = (0..*size).map(|i| b'a' + ((i + index) % 26) as u8).collect();
        entries.push(ManifestEntry {
            href: href.to_string(),
            size: *size as u64,
            integrity: compute_integrity(HashAlgorithm::Sha256, &body),
        });
        bodies.push((href.to_string(), body));
    }
    (entries, bodies)
}

#[derive(Default)]
pub struct FakeApi {
    check_response: Mutex<CheckDeviceResponse>,
    check_failure: Mutex<Option<String>>,
    check_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(String, CheckDeviceRequest)>>,
    manifests: Mutex<HashMap<String, RemoteManifest>>,
    manifest_failures: AtomicUsize,
    manifest_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, url: &str, snapshot: &str) {
        self.set_check_response(CheckDeviceResponse {
            available: true,
            compatible: true,
            partial: false,
            url: Some(url.to_string()),
            snapshot: Some(snapshot.to_string()),
            build: Some(format!("build-{}", snapshot)),
        });
    }

    pub fn set_check_response(&self, response: CheckDeviceResponse) {
        *self.check_response.lock().expect("check lock") = response;
    }

    pub fn fail_checks(&self, message: Option<&str>) {
        *self.check_failure.lock().expect("check lock") = message.map(str::to_string);
    }

    pub fn delay_checks(&self, delay: Duration) {
        *self.check_delay.lock().expect("check lock") = Some(delay);
    }

    pub fn requests(&self) -> Vec<(String, CheckDeviceRequest)> {
        self.requests.lock().expect("request lock").clone()
    }

    pub fn set_manifest(&self, url: &str, entries: Vec<ManifestEntry>, base_url: &str) {
        self.manifests.lock().expect("manifest lock").insert(
            url.to_string(),
            RemoteManifest {
                entries,
                base_url: base_url.to_string(),
            },
        );
    }

    pub fn fail_manifest_fetches(&self, count: usize) {
        self.manifest_failures.store(count, Ordering::SeqCst);
    }

    pub fn manifest_calls(&self) -> usize {
        self.manifest_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeployApi for FakeApi {
    async fn check_device(
        &self,
        endpoint: &str,
        request: &CheckDeviceRequest,
    ) -> Result<CheckDeviceResponse> {
        self.requests
            .lock()
            .expect("request lock")
            .push((endpoint.to_string(), request.clone()));
        let delay = *self.check_delay.lock().expect("check lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.check_failure.lock().expect("check lock").clone() {
            return Err(DeployError::Http(message));
        }
        Ok(self.check_response.lock().expect("check lock").clone())
    }

    async fn fetch_manifest(&self, url: &str) -> Result<RemoteManifest> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.manifest_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.manifest_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DeployError::Http("Error Status 503: unavailable".to_string()));
        }
        self.manifests
            .lock()
            .expect("manifest lock")
            .get(url)
            .cloned()
            .ok_or_else(|| DeployError::Http(format!("Error Status 404: {}", url)))
    }
}

/// Local filesystem transport whose downloads are served from memory.
pub struct FakeTransport {
    local: LocalFileTransport,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTransport {
    pub fn new(data_root: PathBuf, bundle_root: PathBuf) -> Self {
        Self {
            local: LocalFileTransport::new(data_root, bundle_root),
            bodies: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            downloads: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            default_delay: Mutex::new(None),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies
            .lock()
            .expect("body lock")
            .insert(url.to_string(), body);
    }

    pub fn fail_url(&self, url: &str) {
        self.failing
            .lock()
            .expect("failure lock")
            .insert(url.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().expect("failure lock").clear();
    }

    /// Every download sleeps for `delay` before writing its body.
    pub fn delay_downloads(&self, delay: Duration) {
        *self.default_delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn delay_url(&self, url: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delay lock")
            .insert(url.to_string(), delay);
    }

    /// Most downloads that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// URLs in the order their downloads finished.
    pub fn finished_urls(&self) -> Vec<String> {
        self.finished.lock().expect("download lock").clone()
    }

    pub fn downloaded_urls(&self) -> Vec<String> {
        self.downloads.lock().expect("download lock").clone()
    }

    pub fn download_count(&self, url: &str) -> usize {
        self.downloaded_urls()
            .iter()
            .filter(|candidate| candidate.as_str() == url)
            .count()
    }
}

#[async_trait]
impl FileTransport for FakeTransport {
    async fn ensure_directory(&self, path: &str) -> Result<()> {
        self.local.ensure_directory(path).await
    }

    async fn exists(&self, path: &str) -> bool {
        self.local.exists(path).await
    }

    async fn file_size(&self, path: &str) -> Result<Option<u64>> {
        self.local.file_size(path).await
    }

    async fn copy(&self, source: &CopySource, target: &str) -> Result<()> {
        self.local.copy(source, target).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.local.remove(path).await
    }

    async fn read_text(&self, path: &str) -> Result<String> {
        self.local.read_text(path).await
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.local.read_bytes(path).await
    }

    async fn write_text(&self, path: &str, contents: &str) -> Result<()> {
        self.local.write_text(path, contents).await
    }

    async fn download(
        &self,
        url: &str,
        dest: &str,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64> {
        self.downloads
            .lock()
            .expect("download lock")
            .push(url.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .expect("delay lock")
            .get(url)
            .copied()
            .or(*self.default_delay.lock().expect("delay lock"));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.serve_download(url, dest, on_bytes).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .expect("download lock")
            .push(url.to_string());
        result
    }
}

impl FakeTransport {
    async fn serve_download(
        &self,
        url: &str,
        dest: &str,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64> {
        if self.failing.lock().expect("failure lock").contains(url) {
            return Err(DeployError::Http(format!("GET {} -> HTTP 500", url)));
        }
        let body = self
            .bodies
            .lock()
            .expect("body lock")
            .get(url)
            .cloned()
            .ok_or_else(|| DeployError::Http(format!("GET {} -> HTTP 404", url)))?;

        let dest = PathBuf::from(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, &body).await?;
        let half = body.len() / 2;
        on_bytes(half as u64);
        on_bytes((body.len() - half) as u64);
        Ok(body.len() as u64)
    }
}

pub struct TestApp {
    pub data_dir: String,
    pub bundle_dir: String,
    pub api: Arc<FakeApi>,
    pub files: Arc<FakeTransport>,
    pub host: Arc<LocalHost>,
    pub prefs: Arc<MemoryPreferences>,
    pub manager: DeployManager,
}

impl TestApp {
    pub async fn new(prefs: Preferences) -> Self {
        Self::with_tuning(prefs, test_tuning()).await
    }

    pub async fn with_tuning(prefs: Preferences, tuning: DeployTuning) -> Self {
        Self::build(prefs, tuning, "android").await
    }

    pub async fn build(prefs: Preferences, tuning: DeployTuning, platform: &str) -> Self {
        let root = temp_root();
        let data = root.join("data");
        let bundle = root.join("bundle");
        std::fs::create_dir_all(bundle.join("plugins/camera")).expect("create bundle");
        std::fs::create_dir_all(&data).expect("create data");
        std::fs::write(bundle.join("index.html"), "<html>bundle</html>").expect("write index");
        std::fs::write(bundle.join("cordova.js"), "cordova-2").expect("write cordova");
        std::fs::write(bundle.join("cordova_plugins.js"), "plugins-2").expect("write plugins");
        std::fs::write(bundle.join("wk-plugin.js"), "wk-2").expect("write wk plugin");
        std::fs::write(bundle.join("plugins/camera/camera.js"), "camera-2").expect("write plugin");

        let data_dir = data.to_string_lossy().to_string();
        let bundle_dir = bundle.to_string_lossy().to_string();
        let app_info = AppInfo {
            platform: platform.to_string(),
            platform_version: "14".to_string(),
            device: Some("device-1".to_string()),
            data_directory: data_dir.clone(),
            bundle_directory: bundle_dir.clone(),
        };

        let api = Arc::new(FakeApi::new());
        let files = Arc::new(FakeTransport::new(data, bundle));
        let host = Arc::new(LocalHost::new(app_info));
        let prefs = Arc::new(MemoryPreferences::new(prefs));
        let store = PreferencesStore::load(prefs.clone())
            .await
            .expect("load preferences");
        let manager = DeployManager::new(store, files.clone(), host.clone(), api.clone(), tuning)
            .await
            .expect("build manager");

        Self {
            data_dir,
            bundle_dir,
            api,
            files,
            host,
            prefs,
            manager,
        }
    }

    pub fn snapshot_dir(&self, version_id: &str) -> String {
        crate::utils::paths::snapshot_dir(&self.data_dir, version_id)
    }

    /// Serves `files` under `url`, returning the manifest entries.
    pub fn publish(&self, url: &str, files: &[(&str, usize)]) -> Vec<ManifestEntry> {
        let (entries, bodies) = manifest_for(files);
        let base_url = format!("{}/manifest.json", url);
        for (href, body) in bodies {
            self.files.serve(&format!("{}/{}", url, href), body);
        }
        self.api.set_manifest(url, entries.clone(), &base_url);
        entries
    }
}

pub fn test_tuning() -> DeployTuning {
    DeployTuning {
        file_retry_wait: Duration::from_millis(1),
        ..DeployTuning::default()
    }
}

pub fn app_prefs() -> Preferences {
    Preferences {
        app_id: "A".to_string(),
        channel: "production".to_string(),
        binary_version_name: "1.0".to_string(),
        binary_version_code: "1".to_string(),
        max_versions: 3,
        ..Preferences::default()
    }
}
