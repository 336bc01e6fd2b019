use std::time::Duration;

const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 5;
const DEFAULT_FILE_MAX_ATTEMPTS: usize = 2;
const DEFAULT_FILE_RETRY_WAIT_MS: u64 = 1000;
const DEFAULT_CHECK_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_MANIFEST_MAX_ATTEMPTS: usize = 3;
const DEFAULT_CANCEL_BACKSTOP_SECS: u64 = 65;

/// Engine knobs that are not part of the persisted preferences.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployTuning {
    pub download_concurrency: usize,
    pub file_max_attempts: usize,
    pub file_retry_wait: Duration,
    pub check_timeout: Duration,
    pub manifest_max_attempts: usize,
    pub cancel_backstop: Duration,
    pub strict_hash: bool,
    pub excluded_prefixes: Vec<String>,
}

impl Default for DeployTuning {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            file_max_attempts: DEFAULT_FILE_MAX_ATTEMPTS,
            file_retry_wait: Duration::from_millis(DEFAULT_FILE_RETRY_WAIT_MS),
            check_timeout: Duration::from_millis(DEFAULT_CHECK_TIMEOUT_MS),
            manifest_max_attempts: DEFAULT_MANIFEST_MAX_ATTEMPTS,
            cancel_backstop: Duration::from_secs(DEFAULT_CANCEL_BACKSTOP_SECS),
            strict_hash: false,
            excluded_prefixes: Vec::new(),
        }
    }
}

impl DeployTuning {
    pub fn from_env() -> Self {
        let download_concurrency = env_usize("LIVE_UPDATE_DOWNLOAD_CONCURRENCY")
            .unwrap_or(DEFAULT_DOWNLOAD_CONCURRENCY)
            .clamp(1, 16);
        let file_max_attempts = env_usize("LIVE_UPDATE_FILE_MAX_ATTEMPTS")
            .unwrap_or(DEFAULT_FILE_MAX_ATTEMPTS)
            .clamp(1, 8);
        let file_retry_wait_ms = env_usize("LIVE_UPDATE_FILE_RETRY_WAIT_MS")
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_FILE_RETRY_WAIT_MS)
            .clamp(0, 30_000);
        let check_timeout_ms = env_usize("LIVE_UPDATE_CHECK_TIMEOUT_MS")
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_CHECK_TIMEOUT_MS)
            .clamp(1_000, 120_000);
        let manifest_max_attempts = env_usize("LIVE_UPDATE_MANIFEST_MAX_ATTEMPTS")
            .unwrap_or(DEFAULT_MANIFEST_MAX_ATTEMPTS)
            .clamp(1, 8);
        let cancel_backstop_secs = env_usize("LIVE_UPDATE_CANCEL_BACKSTOP_SECS")
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_CANCEL_BACKSTOP_SECS)
            .clamp(1, 600);

        Self {
            download_concurrency,
            file_max_attempts,
            file_retry_wait: Duration::from_millis(file_retry_wait_ms),
            check_timeout: Duration::from_millis(check_timeout_ms),
            manifest_max_attempts,
            cancel_backstop: Duration::from_secs(cancel_backstop_secs),
            strict_hash: env_truthy("LIVE_UPDATE_STRICT_HASH"),
            excluded_prefixes: env_list("LIVE_UPDATE_EXCLUDED_PREFIXES"),
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
