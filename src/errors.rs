use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("The device is offline.")]
    Offline,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Integrity check failed for {file}: {reason}")]
    Integrity { file: String, reason: String },
    #[error("Inconsistent state: {0}")]
    Inconsistency(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Bridge error: {0}")]
    Bridge(String),
}

impl DeployError {
    pub fn integrity(file: impl Into<String>, reason: impl Into<String>) -> Self {
        DeployError::Integrity {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
