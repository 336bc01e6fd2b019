use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::DeployTuning;
use crate::errors::Result;
use crate::models::ManifestEntry;
use crate::services::api_client::{DeployApi, RemoteManifest};
use crate::utils::file::FileTransport;
use crate::utils::paths;

/// Manifest applied to a snapshot, stored inside the snapshot directory.
pub const MANIFEST_FILE: &str = "pro-manifest.json";
/// Build marker the pipeline rewrites after hashing; never trusted from a previous snapshot.
pub const VERSION_MARKER_FILE: &str = "version.json";

/// Entry appended to a non-empty diff so the applied manifest is persisted with the files.
pub fn manifest_descriptor() -> ManifestEntry {
    ManifestEntry {
        href: MANIFEST_FILE.to_string(),
        size: 0,
        integrity: "void".to_string(),
    }
}

pub fn is_manifest_descriptor(entry: &ManifestEntry) -> bool {
    entry.href == MANIFEST_FILE
}

#[derive(Clone)]
pub struct ManifestService {
    api: Arc<dyn DeployApi>,
    files: Arc<dyn FileTransport>,
    data_dir: String,
    max_attempts: usize,
    retry_wait: Duration,
    excluded_prefixes: Vec<String>,
}

impl ManifestService {
    pub fn new(
        api: Arc<dyn DeployApi>,
        files: Arc<dyn FileTransport>,
        data_dir: impl Into<String>,
        tuning: &DeployTuning,
    ) -> Self {
        Self {
            api,
            files,
            data_dir: data_dir.into(),
            max_attempts: tuning.manifest_max_attempts.max(1),
            retry_wait: tuning.file_retry_wait,
            excluded_prefixes: tuning.excluded_prefixes.clone(),
        }
    }

    pub async fn fetch_remote_manifest(&self, url: &str) -> Result<RemoteManifest> {
        let mut attempt = 1;
        loop {
            match self.api.fetch_manifest(url).await {
                Ok(manifest) => {
                    tracing::info!(
                        "fetched manifest with {} entries from {}",
                        manifest.entries.len(),
                        manifest.base_url
                    );
                    return Ok(manifest);
                }
                Err(err) if attempt < self.max_attempts => {
                    tracing::warn!(
                        "manifest fetch failed: {} [attempt {}/{}]",
                        err,
                        attempt,
                        self.max_attempts
                    );
                    attempt += 1;
                    sleep(self.retry_wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn manifest_path(&self, version_id: &str) -> String {
        let dir = paths::snapshot_dir(&self.data_dir, version_id);
        paths::join(&[dir.as_str(), MANIFEST_FILE])
    }

    /// Manifest recorded in a snapshot directory. Missing or unreadable means empty.
    pub async fn snapshot_manifest(&self, version_id: &str) -> Vec<ManifestEntry> {
        let path = self.manifest_path(version_id);
        let contents = match self.files.read_text(&path).await {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<ManifestEntry>>(&contents) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("could not parse {}: {}", path, err);
                Vec::new()
            }
        }
    }

    pub async fn write_snapshot_manifest(
        &self,
        version_id: &str,
        entries: &[ManifestEntry],
    ) -> Result<()> {
        let payload = serde_json::to_string(entries)?;
        self.files
            .write_text(&self.manifest_path(version_id), &payload)
            .await
    }

    /// Remote entries the snapshot for `version_id` does not already hold.
    pub async fn diff(&self, remote: &[ManifestEntry], version_id: &str) -> Vec<ManifestEntry> {
        let local = self.snapshot_manifest(version_id).await;
        let differences = diff_entries(remote, &local, &self.excluded_prefixes);
        tracing::debug!(
            "{} of {} manifest entries differ from snapshot {}",
            differences.len(),
            remote.len(),
            version_id
        );
        differences
    }
}

pub fn diff_entries(
    remote: &[ManifestEntry],
    local: &[ManifestEntry],
    excluded_prefixes: &[String],
) -> Vec<ManifestEntry> {
    let known: HashSet<&ManifestEntry> = local.iter().collect();
    let mut differences: Vec<ManifestEntry> = remote
        .iter()
        .filter(|entry| !is_manifest_descriptor(entry))
        .filter(|entry| {
            !excluded_prefixes
                .iter()
                .any(|prefix| entry.href.starts_with(prefix.as_str()))
        })
        .filter(|entry| entry.href == VERSION_MARKER_FILE || !known.contains(entry))
        .cloned()
        .collect();

    if !differences.is_empty() {
        differences.push(manifest_descriptor());
    }
    differences
}
