use std::path::{Path, PathBuf};

/// Directory under the data directory that holds one folder per snapshot.
pub const SNAPSHOT_CACHE: &str = "live_snapshots";

/// POSIX-style join. Exactly one `/` separates parts; `..` and `.` are kept verbatim.
pub fn join(parts: &[&str]) -> String {
    let mut iter = parts.iter();
    let mut full = iter.next().map(|part| part.to_string()).unwrap_or_default();
    for part in iter {
        if !full.is_empty() && !full.ends_with('/') {
            full.push('/');
        }
        match part.strip_prefix('/') {
            Some(rest) if !full.is_empty() => full.push_str(rest),
            _ => full.push_str(part),
        }
    }
    full
}

pub fn snapshot_cache_root(data_dir: &str) -> String {
    join(&[data_dir, SNAPSHOT_CACHE])
}

pub fn snapshot_dir(data_dir: &str, version_id: &str) -> String {
    join(&[data_dir, SNAPSHOT_CACHE, version_id])
}

/// Path of a snapshot relative to the data directory.
pub fn snapshot_relative(version_id: &str) -> String {
    join(&[SNAPSHOT_CACHE, version_id])
}

/// Whether a manifest href stays inside the directory it is joined onto.
pub fn is_safe_relative_path(href: &str) -> bool {
    use std::path::Component;
    if href.trim().is_empty() {
        return false;
    }
    for component in Path::new(href).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

pub fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(value) = std::env::var("LIVE_UPDATE_LOG_DIR") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if let Some(dir) = ensure_dir(&path) {
                return dir;
            }
        }
    }

    let candidate = data_dir.join("logs");
    if let Some(found) = ensure_dir(&candidate) {
        return found;
    }

    PathBuf::from("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_normalizes_separators_without_resolving_dots() {
        assert_eq!(join(&["/data", "live_snapshots", "v1"]), "/data/live_snapshots/v1");
        assert_eq!(join(&["/data/", "/build/main.js"]), "/data/build/main.js");
        assert_eq!(join(&["/data", "../outside"]), "/data/../outside");
        assert_eq!(join(&["", "relative"]), "relative");
        assert_eq!(join(&[]), "");
    }

    #[test]
    fn hrefs_escaping_the_snapshot_are_unsafe() {
        assert!(is_safe_relative_path("index.html"));
        assert!(is_safe_relative_path("build/./main.js"));
        assert!(!is_safe_relative_path("../escape.js"));
        assert!(!is_safe_relative_path("assets/../../v1/index.html"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn snapshot_paths_share_the_cache_root() {
        assert_eq!(snapshot_cache_root("/data"), "/data/live_snapshots");
        assert_eq!(snapshot_dir("/data/", "abc"), "/data/live_snapshots/abc");
        assert_eq!(snapshot_relative("abc"), "live_snapshots/abc");
    }
}
