use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{DeployError, Result};
use crate::events::{EventBus, IntegrityFailureKind};
use crate::models::ManifestEntry;
use crate::services::manifest_service::VERSION_MARKER_FILE;
use crate::utils::crypto::integrity_matches;
use crate::utils::file::FileTransport;
use crate::utils::paths;

const ENTRY_HTML: &str = "index.html";

/// Build-tool generation a set of core file patterns belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildGeneration {
    /// Unhashed `build/` bundles.
    Legacy,
    /// Content-hashed bundles at the web root.
    Modern,
}

struct CorePatternSet {
    generation: BuildGeneration,
    patterns: Vec<Regex>,
}

const CORE_PATTERNS: &[(BuildGeneration, &[&str])] = &[
    (
        BuildGeneration::Legacy,
        &[
            r"build/main(\.\w*)?\.js$",
            r"build/vendor(\.\w*)?\.js$",
            r"build/polyfills\.js$",
        ],
    ),
    (
        BuildGeneration::Modern,
        &[
            r"(^|/)main\.\w+\.js$",
            r"(^|/)polyfills\.\w+\.js$",
            r"(^|/)runtime\.\w+\.js$",
            r"(^|/)vendor\.\w+\.js$",
        ],
    ),
];

// Tried in order; the first set that matches any manifest entry is used.
static CORE_PATTERN_SETS: Lazy<Vec<CorePatternSet>> = Lazy::new(|| {
    CORE_PATTERNS
        .iter()
        .map(|(generation, patterns)| CorePatternSet {
            generation: *generation,
            patterns: patterns
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        })
        .collect()
});

pub fn is_entry_html(href: &str) -> bool {
    href == ENTRY_HTML || href.ends_with("/index.html")
}

/// Generation whose patterns match the manifest, if any does.
pub fn detect_generation(manifest: &[ManifestEntry]) -> Option<BuildGeneration> {
    CORE_PATTERN_SETS
        .iter()
        .find(|set| {
            manifest
                .iter()
                .any(|entry| set.patterns.iter().any(|re| re.is_match(&entry.href)))
        })
        .map(|set| set.generation)
}

pub fn is_core_href(href: &str, generation: Option<BuildGeneration>) -> bool {
    if is_entry_html(href) {
        return true;
    }
    let Some(generation) = generation else {
        return false;
    };
    CORE_PATTERN_SETS
        .iter()
        .filter(|set| set.generation == generation)
        .any(|set| set.patterns.iter().any(|re| re.is_match(href)))
}

/// Entries whose corruption would keep the app from booting.
pub fn core_files(manifest: &[ManifestEntry]) -> Vec<ManifestEntry> {
    let generation = detect_generation(manifest);
    manifest
        .iter()
        .filter(|entry| is_core_href(&entry.href, generation))
        .cloned()
        .collect()
}

/// Post-download checks of snapshot files against their manifest entries.
#[derive(Clone)]
pub struct IntegrityService {
    files: Arc<dyn FileTransport>,
    events: EventBus,
    strict_hash: bool,
}

impl IntegrityService {
    pub fn new(files: Arc<dyn FileTransport>, events: EventBus, strict_hash: bool) -> Self {
        Self {
            files,
            events,
            strict_hash,
        }
    }

    /// Size check of `entry` under `dir`, plus a content hash check when `core` is set.
    /// Hash mismatches only fail in strict mode.
    pub async fn check_file_integrity(
        &self,
        entry: &ManifestEntry,
        dir: &str,
        core: bool,
    ) -> Result<()> {
        let path = paths::join(&[dir, entry.href.as_str()]);
        let actual_size = match self.files.file_size(&path).await {
            Ok(Some(size)) => size,
            Ok(None) => return Err(self.fail(entry, "file is missing".to_string())),
            Err(err) => return Err(self.fail(entry, format!("cannot stat file: {}", err))),
        };

        if entry.size == 0 {
            return Ok(());
        }

        // Rewritten after build, so only presence is checked.
        if is_entry_html(&entry.href) || entry.href == VERSION_MARKER_FILE {
            if actual_size > 0 {
                return Ok(());
            }
            return Err(self.fail(entry, format!("{} is empty", entry.href)));
        }

        if actual_size != entry.size {
            return Err(self.fail(
                entry,
                format!(
                    "size mismatch: expected {} bytes, found {}",
                    entry.size, actual_size
                ),
            ));
        }

        if core {
            self.check_core_hash(entry, &path).await?;
        }
        Ok(())
    }

    /// Rejects hrefs that would resolve outside the snapshot directory.
    pub fn check_href(&self, entry: &ManifestEntry) -> Result<()> {
        if paths::is_safe_relative_path(&entry.href) {
            return Ok(());
        }
        Err(self.fail(entry, "path escapes the snapshot directory".to_string()))
    }

    /// Checks every core file of `manifest` under `dir`, stopping at the first failure.
    pub async fn verify_core_files(&self, manifest: &[ManifestEntry], dir: &str) -> Result<()> {
        let core = core_files(manifest);
        tracing::debug!("verifying {} core files under {}", core.len(), dir);
        for entry in &core {
            self.check_file_integrity(entry, dir, true).await?;
        }
        Ok(())
    }

    async fn check_core_hash(&self, entry: &ManifestEntry, path: &str) -> Result<()> {
        let contents = match self.files.read_bytes(path).await {
            Ok(contents) => contents,
            Err(err) => return Err(self.fail(entry, format!("cannot read file: {}", err))),
        };
        match integrity_matches(&entry.integrity, &contents) {
            Some(true) => Ok(()),
            Some(false) => {
                tracing::warn!("core file {} does not match its integrity hash", entry.href);
                if self.strict_hash {
                    return Err(self.fail(entry, "content hash mismatch".to_string()));
                }
                Ok(())
            }
            None => {
                tracing::debug!("no verifiable digest for core file {}", entry.href);
                Ok(())
            }
        }
    }

    fn fail(&self, entry: &ManifestEntry, reason: String) -> DeployError {
        tracing::warn!("integrity check failed for {}: {}", entry.href, reason);
        self.events
            .integrity_failed(IntegrityFailureKind::Integrity, Some(&entry.href));
        DeployError::integrity(entry.href.clone(), reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeployEvent;
    use crate::test_support::temp_root;
    use crate::utils::crypto::{compute_integrity, HashAlgorithm};
    use crate::utils::file::LocalFileTransport;

    fn entry(href: &str, size: u64, integrity: &str) -> ManifestEntry {
        ManifestEntry {
            href: href.to_string(),
            size,
            integrity: integrity.to_string(),
        }
    }

    fn service(strict_hash: bool) -> (IntegrityService, EventBus, String) {
        let root = temp_root();
        let files = Arc::new(LocalFileTransport::new(root.clone(), root.clone()));
        let events = EventBus::new();
        let service = IntegrityService::new(files, events.clone(), strict_hash);
        (service, events, root.to_string_lossy().to_string())
    }

    #[test]
    fn every_core_pattern_compiles() {
        let compiled: usize = CORE_PATTERN_SETS.iter().map(|set| set.patterns.len()).sum();
        let declared: usize = CORE_PATTERNS.iter().map(|(_, patterns)| patterns.len()).sum();
        assert_eq!(compiled, declared);
    }

    #[test]
    fn first_matching_generation_wins() {
        let legacy = vec![
            entry("index.html", 1, "void"),
            entry("build/main.js", 1, "void"),
            entry("build/vendor.js", 1, "void"),
            entry("main.abc123.js", 1, "void"),
            entry("assets/logo.png", 1, "void"),
        ];
        assert_eq!(detect_generation(&legacy), Some(BuildGeneration::Legacy));
        let hrefs: Vec<String> = core_files(&legacy).into_iter().map(|e| e.href).collect();
        assert_eq!(hrefs, vec!["index.html", "build/main.js", "build/vendor.js"]);

        let modern = vec![
            entry("index.html", 1, "void"),
            entry("runtime.1a2b.js", 1, "void"),
            entry("main.3c4d.js", 1, "void"),
            entry("styles.5e6f.css", 1, "void"),
        ];
        assert_eq!(detect_generation(&modern), Some(BuildGeneration::Modern));
        assert_eq!(core_files(&modern).len(), 3);

        let plain = vec![entry("index.html", 1, "void"), entry("app.js", 1, "void")];
        assert_eq!(detect_generation(&plain), None);
        assert_eq!(core_files(&plain), vec![entry("index.html", 1, "void")]);
    }

    #[tokio::test]
    async fn size_mismatch_on_core_file_fails_and_emits_event() {
        let (service, events, dir) = service(false);
        let mut rx = events.subscribe();
        std::fs::create_dir_all(format!("{}/build", dir)).expect("create build dir");
        std::fs::write(format!("{}/build/main.js", dir), vec![b'x'; 500]).expect("write file");

        let result = service
            .check_file_integrity(&entry("build/main.js", 1000, "sha256-x"), &dir, true)
            .await;

        match result {
            Err(DeployError::Integrity { file, reason }) => {
                assert_eq!(file, "build/main.js");
                assert!(reason.contains("1000"), "reason: {}", reason);
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert_eq!(
            rx.try_recv().expect("event emitted"),
            DeployEvent::IntegrityCheckFailed {
                kind: IntegrityFailureKind::Integrity,
                file: Some("build/main.js".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn missing_file_fails_but_zero_size_and_entry_html_pass() {
        let (service, _events, dir) = service(false);
        std::fs::write(format!("{}/index.html", dir), "<html></html>").expect("write index");
        std::fs::write(format!("{}/pro-manifest.json", dir), "[]").expect("write manifest");

        assert!(service
            .check_file_integrity(&entry("gone.js", 3, "void"), &dir, false)
            .await
            .is_err());
        assert!(service
            .check_file_integrity(&entry("pro-manifest.json", 0, "void"), &dir, false)
            .await
            .is_ok());
        assert!(service
            .check_file_integrity(&entry("index.html", 9999, "sha256-x"), &dir, true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rewritten_version_marker_only_needs_content() {
        let (service, _events, dir) = service(true);
        let marker = entry("version.json", 20, "sha256-x");

        std::fs::write(format!("{}/version.json", dir), r#"{"version":"1.4.2-rc"}"#)
            .expect("write marker");
        assert!(service.check_file_integrity(&marker, &dir, false).await.is_ok());

        std::fs::write(format!("{}/version.json", dir), "").expect("truncate marker");
        assert!(service.check_file_integrity(&marker, &dir, false).await.is_err());
    }

    #[tokio::test]
    async fn hash_mismatch_is_fatal_only_in_strict_mode() {
        let body = b"console.log('main');";
        let wrong = compute_integrity(HashAlgorithm::Sha256, b"something else");
        let right = compute_integrity(HashAlgorithm::Sha384, body);

        let (lenient, _events, dir) = service(false);
        std::fs::write(format!("{}/main.abc.js", dir), body).expect("write file");
        let bad = entry("main.abc.js", body.len() as u64, &wrong);
        assert!(lenient.check_file_integrity(&bad, &dir, true).await.is_ok());

        let (strict, _events, dir) = service(true);
        std::fs::write(format!("{}/main.abc.js", dir), body).expect("write file");
        assert!(strict.check_file_integrity(&bad, &dir, true).await.is_err());
        assert!(strict.check_file_integrity(&bad, &dir, false).await.is_ok());
        let good = entry("main.abc.js", body.len() as u64, &right);
        assert!(strict.check_file_integrity(&good, &dir, true).await.is_ok());
    }
}
