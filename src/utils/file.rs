use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::errors::{DeployError, Result};

/// Where the path of a [`CopySource`] is resolved from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceRoot {
    /// Assets shipped inside the binary.
    Bundle,
    /// The writable application data directory.
    Data,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopySource {
    pub root: SourceRoot,
    pub path: String,
}

impl CopySource {
    pub fn bundle(path: impl Into<String>) -> Self {
        Self {
            root: SourceRoot::Bundle,
            path: path.into(),
        }
    }

    pub fn data(path: impl Into<String>) -> Self {
        Self {
            root: SourceRoot::Data,
            path: path.into(),
        }
    }
}

/// File operations the update engine needs from the host.
///
/// Target paths are absolute. `remove` treats a missing target as success.
/// `download` reports byte deltas through `on_bytes` and leaves retrying to the caller.
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn ensure_directory(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> bool;
    async fn file_size(&self, path: &str) -> Result<Option<u64>>;
    async fn copy(&self, source: &CopySource, target: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn read_text(&self, path: &str) -> Result<String>;
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_text(&self, path: &str, contents: &str) -> Result<()>;
    async fn download(
        &self,
        url: &str,
        dest: &str,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64>;
}

/// [`FileTransport`] over the local filesystem, downloading with reqwest.
#[derive(Clone)]
pub struct LocalFileTransport {
    client: reqwest::Client,
    data_root: PathBuf,
    bundle_root: PathBuf,
}

impl LocalFileTransport {
    pub fn new(data_root: PathBuf, bundle_root: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            data_root,
            bundle_root,
        }
    }

    fn resolve_source(&self, source: &CopySource) -> PathBuf {
        let relative = source.path.trim_start_matches('/');
        match source.root {
            SourceRoot::Bundle => self.bundle_root.join(relative),
            SourceRoot::Data => self.data_root.join(relative),
        }
    }
}

#[async_trait]
impl FileTransport for LocalFileTransport {
    async fn ensure_directory(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn file_size(&self, path: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, source: &CopySource, target: &str) -> Result<()> {
        let from = self.resolve_source(source);
        let metadata = tokio::fs::metadata(&from).await.map_err(|err| {
            DeployError::NotFound(format!("copy source {}: {}", from.display(), err))
        })?;
        let target = PathBuf::from(target);

        if metadata.is_dir() {
            remove_path(&target).await?;
            copy_dir_recursive(&from, &target).await
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&from, &target).await?;
            Ok(())
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        remove_path(Path::new(path)).await
    }

    async fn read_text(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_text(&self, path: &str, contents: &str) -> Result<()> {
        write_atomic(Path::new(path), contents.as_bytes()).await
    }

    async fn download(
        &self,
        url: &str,
        dest: &str,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::Http(format!(
                "GET {} -> HTTP {} ({})",
                url,
                status.as_u16(),
                trim_text_snippet(&body)
            )));
        }

        let dest = PathBuf::from(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = part_path(&dest);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(next) = stream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(err.into());
                }
            };
            file.write_all(&bytes).await?;
            written = written.saturating_add(bytes.len() as u64);
            on_bytes(bytes.len() as u64);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &dest).await?;
        Ok(written)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_path(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let outcome = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, target)) = pending.pop() {
        tokio::fs::create_dir_all(&target).await?;
        let mut entries = tokio::fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let destination = target.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), destination));
            } else {
                tokio::fs::copy(entry.path(), &destination).await?;
            }
        }
    }
    Ok(())
}

fn trim_text_snippet(value: &str) -> String {
    value
        .chars()
        .take(200)
        .collect::<String>()
        .trim()
        .to_string()
}
