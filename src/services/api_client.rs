use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;

use crate::errors::{DeployError, Result};
use crate::models::{CheckDeviceEnvelope, CheckDeviceRequest, CheckDeviceResponse, ManifestEntry};

/// A manifest plus the URL it was finally served from, after redirects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteManifest {
    pub entries: Vec<ManifestEntry>,
    pub base_url: String,
}

/// Network side of the update channel.
#[async_trait]
pub trait DeployApi: Send + Sync {
    async fn check_device(
        &self,
        endpoint: &str,
        request: &CheckDeviceRequest,
    ) -> Result<CheckDeviceResponse>;

    async fn fetch_manifest(&self, url: &str) -> Result<RemoteManifest>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(6))
            .redirect(Policy::limited(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl DeployApi for ApiClient {
    async fn check_device(
        &self,
        endpoint: &str,
        request: &CheckDeviceRequest,
    ) -> Result<CheckDeviceResponse> {
        let response = self.client.post(endpoint).json(request).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeployError::Http(http_error_message(status.as_u16(), &text)));
        }

        let envelope: CheckDeviceEnvelope = serde_json::from_str(&text)?;
        Ok(envelope.data)
    }

    async fn fetch_manifest(&self, url: &str) -> Result<RemoteManifest> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let base_url = response.url().to_string();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DeployError::Http(http_error_message(status.as_u16(), &text)));
        }

        let entries = response.json::<Vec<ManifestEntry>>().await?;
        Ok(RemoteManifest { entries, base_url })
    }
}

/// Message for a non-2xx response: the server's `error.message` when the body is JSON
/// carrying one, otherwise the raw body.
pub fn http_error_message(status: u16, body: &str) -> String {
    let server_message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(|message| message.as_str())
                .map(str::to_string)
        });
    let detail = server_message.unwrap_or_else(|| body.trim().to_string());
    format!("Error Status {}: {}", status, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_server_json() {
        let body = r#"{"error":{"message":"App not found","type":"NotFound"}}"#;
        assert_eq!(
            http_error_message(404, body),
            "Error Status 404: App not found"
        );
    }

    #[test]
    fn error_message_falls_back_to_raw_body() {
        assert_eq!(
            http_error_message(502, " <html>Bad Gateway</html>\n"),
            "Error Status 502: <html>Bad Gateway</html>"
        );
        assert_eq!(
            http_error_message(400, r#"{"detail":"nope"}"#),
            r#"Error Status 400: {"detail":"nope"}"#
        );
    }

    #[test]
    fn check_device_envelope_parses_optional_fields() {
        let body = r#"{"data":{"available":true,"compatible":true,"partial":false,
            "url":"https://cdn/x","snapshot":"v1"},"meta":{"status":200}}"#;
        let envelope: CheckDeviceEnvelope = serde_json::from_str(body).expect("parse");
        assert!(envelope.data.available);
        assert_eq!(envelope.data.snapshot.as_deref(), Some("v1"));
        assert_eq!(envelope.data.build, None);
    }
}
