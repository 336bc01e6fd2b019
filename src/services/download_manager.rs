use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::sleep;
use url::Url;

use crate::config::DeployTuning;
use crate::errors::Result;
use crate::events::{EventBus, IntegrityFailureKind};
use crate::models::ManifestEntry;
use crate::services::cancel_token::CancelToken;
use crate::services::integrity_service::{detect_generation, is_core_href, IntegrityService};
use crate::services::manifest_service::{is_manifest_descriptor, ManifestService};
use crate::utils::file::{CopySource, FileTransport};
use crate::utils::paths;

/// Files of an interrupted download that already passed their checks.
pub const JOURNAL_FILE: &str = ".download-journal.json";

/// Receives whole-number download percentages.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}

enum FileOutcome {
    Completed(ManifestEntry),
    Cancelled,
}

/// Fetches the files of a manifest diff into a snapshot directory.
#[derive(Clone)]
pub struct DownloadManager {
    files: Arc<dyn FileTransport>,
    manifests: ManifestService,
    integrity: IntegrityService,
    events: EventBus,
    data_dir: String,
    concurrency: usize,
    max_attempts: usize,
    retry_wait: Duration,
}

impl DownloadManager {
    pub fn new(
        files: Arc<dyn FileTransport>,
        manifests: ManifestService,
        integrity: IntegrityService,
        events: EventBus,
        data_dir: impl Into<String>,
        tuning: &DeployTuning,
    ) -> Self {
        Self {
            files,
            manifests,
            integrity,
            events,
            data_dir: data_dir.into(),
            concurrency: tuning.download_concurrency.max(1),
            max_attempts: tuning.file_max_attempts.max(1),
            retry_wait: tuning.file_retry_wait,
        }
    }

    pub fn snapshot_dir(&self, version_id: &str) -> String {
        paths::snapshot_dir(&self.data_dir, version_id)
    }

    fn journal_path(&self, version_id: &str) -> String {
        let dir = self.snapshot_dir(version_id);
        paths::join(&[dir.as_str(), JOURNAL_FILE])
    }

    /// Seeds the snapshot directory from `base`. A directory holding a journal belongs to an
    /// interrupted download and is kept as is.
    pub async fn prepare_snapshot_dir(&self, version_id: &str, base: &CopySource) -> Result<()> {
        let dir = self.snapshot_dir(version_id);
        if self.files.exists(&self.journal_path(version_id)).await {
            tracing::info!("resuming interrupted download into {}", dir);
            return Ok(());
        }

        let started = Instant::now();
        self.files.remove(&dir).await?;
        self.files
            .ensure_directory(&paths::snapshot_cache_root(&self.data_dir))
            .await?;
        self.files.copy(base, &dir).await?;
        tracing::info!(
            "prepared {} from {:?} {} in {:?}",
            dir,
            base.root,
            base.path,
            started.elapsed()
        );
        Ok(())
    }

    /// Downloads `diff` into the snapshot for `version_id`, then records `manifest` as the
    /// applied manifest. Files recorded in the journal are not fetched again.
    pub async fn download_files(
        &self,
        version_id: &str,
        base_url: &str,
        diff: &[ManifestEntry],
        manifest: &[ManifestEntry],
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> Result<DownloadOutcome> {
        let base = Url::parse(base_url)?;
        let dir = self.snapshot_dir(version_id);
        let generation = detect_generation(manifest);
        let mut journal = self.load_journal(version_id).await;

        let files: Vec<&ManifestEntry> = diff
            .iter()
            .filter(|entry| !is_manifest_descriptor(entry))
            .collect();
        for entry in &files {
            self.integrity.check_href(entry)?;
        }
        let total_bytes: u64 = files.iter().map(|entry| entry.size).sum();
        let mut preexisting = 0u64;
        let mut pending = VecDeque::new();
        for entry in files {
            if journal.contains(entry) {
                preexisting += entry.size;
            } else {
                pending.push_back(entry.clone());
            }
        }

        tracing::info!(
            "downloading {} files ({} bytes, {} already present) for {}",
            pending.len(),
            total_bytes,
            preexisting,
            version_id
        );

        let tracker = ProgressTracker::new(total_bytes, preexisting, progress);
        let limit = self.concurrency.min(pending.len()).max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            while in_flight.len() < limit && !cancel.is_cancelled() {
                let Some(entry) = pending.pop_front() else {
                    break;
                };
                let url = resolve_file_url(&base, &entry.href)?;
                let core = is_core_href(&entry.href, generation);
                in_flight.push(self.fetch_with_retry(entry, url, &dir, core, cancel, &tracker));
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            match result? {
                FileOutcome::Completed(entry) => {
                    journal.insert(entry);
                    self.save_journal(version_id, &journal).await?;
                }
                FileOutcome::Cancelled => cancelled = true,
            }
        }

        if cancelled || !pending.is_empty() {
            tracing::info!(
                "download of {} cancelled with {} files not started",
                version_id,
                pending.len()
            );
            return Ok(DownloadOutcome::Cancelled);
        }

        if !diff.is_empty() {
            self.manifests
                .write_snapshot_manifest(version_id, manifest)
                .await?;
        }
        self.files.remove(&self.journal_path(version_id)).await?;
        tracker.finish();
        tracing::info!("downloaded {} files for {}", diff.len(), version_id);
        Ok(DownloadOutcome::Completed)
    }

    async fn fetch_with_retry(
        &self,
        entry: ManifestEntry,
        url: String,
        dir: &str,
        core: bool,
        cancel: &CancelToken,
        tracker: &ProgressTracker,
    ) -> Result<FileOutcome> {
        let dest = paths::join(&[dir, entry.href.as_str()]);
        // Shared across attempts so a retry never takes progress back.
        let accounted = AtomicU64::new(0);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Ok(FileOutcome::Cancelled);
            }

            match self
                .fetch_once(&entry, &url, &dest, dir, core, &accounted, tracker)
                .await
            {
                Ok(()) => {
                    let rest = entry.size.saturating_sub(accounted.load(Ordering::SeqCst));
                    tracker.add(rest);
                    return Ok(FileOutcome::Completed(entry));
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(FileOutcome::Cancelled);
                    }
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            "giving up on {} after {} attempts: {}",
                            entry.href,
                            attempt,
                            err
                        );
                        return Err(err);
                    }
                    tracing::warn!(
                        "{} -> {} [attempt {}/{}]",
                        url,
                        err,
                        attempt,
                        self.max_attempts
                    );
                    attempt += 1;
                    sleep(self.retry_wait).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_once(
        &self,
        entry: &ManifestEntry,
        url: &str,
        dest: &str,
        dir: &str,
        core: bool,
        accounted: &AtomicU64,
        tracker: &ProgressTracker,
    ) -> Result<()> {
        tracing::debug!("downloading {} -> {}", url, dest);
        let on_bytes = |bytes: u64| {
            let room = entry.size.saturating_sub(accounted.load(Ordering::SeqCst));
            let delta = bytes.min(room);
            if delta > 0 {
                accounted.fetch_add(delta, Ordering::SeqCst);
                tracker.add(delta);
            }
        };

        if let Err(err) = self.files.download(url, dest, &on_bytes).await {
            self.events
                .integrity_failed(IntegrityFailureKind::Http, Some(&entry.href));
            return Err(err);
        }
        self.integrity.check_file_integrity(entry, dir, core).await
    }

    async fn load_journal(&self, version_id: &str) -> HashSet<ManifestEntry> {
        let path = self.journal_path(version_id);
        let Ok(contents) = self.files.read_text(&path).await else {
            return HashSet::new();
        };
        match serde_json::from_str::<Vec<ManifestEntry>>(&contents) {
            Ok(entries) => entries.into_iter().collect(),
            Err(err) => {
                tracing::warn!("ignoring unreadable download journal {}: {}", path, err);
                HashSet::new()
            }
        }
    }

    async fn save_journal(&self, version_id: &str, journal: &HashSet<ManifestEntry>) -> Result<()> {
        let mut entries: Vec<&ManifestEntry> = journal.iter().collect();
        entries.sort_by(|a, b| a.href.cmp(&b.href));
        let payload = serde_json::to_string(&entries)?;
        self.files
            .write_text(&self.journal_path(version_id), &payload)
            .await
    }
}

/// Resolves `href` against `base` and carries over the base query string.
pub fn resolve_file_url(base: &Url, href: &str) -> Result<String> {
    let mut url = base.join(href)?;
    url.set_query(base.query());
    Ok(url.to_string())
}

struct ProgressTracker {
    total_bytes: u64,
    downloaded: AtomicU64,
    last_reported: AtomicI32,
    callback: Option<ProgressFn>,
}

impl ProgressTracker {
    fn new(total_bytes: u64, initial: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            total_bytes,
            downloaded: AtomicU64::new(initial),
            last_reported: AtomicI32::new(0),
            callback,
        }
    }

    fn add(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.report(self.percentage(downloaded));
    }

    fn percentage(&self, downloaded: u64) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        (downloaded.saturating_mul(100) / self.total_bytes).min(100) as u8
    }

    fn finish(&self) {
        self.report(100);
    }

    fn report(&self, percentage: u8) {
        let previous = self
            .last_reported
            .fetch_max(percentage as i32, Ordering::SeqCst);
        if (percentage as i32) <= previous {
            return;
        }
        if let Some(callback) = self.callback.as_ref() {
            callback(percentage);
        }
    }
}
