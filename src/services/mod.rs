pub mod api_client;
pub mod cancel_token;
pub mod deploy_manager;
pub mod download_manager;
pub mod host;
pub mod integrity_service;
pub mod manifest_service;

pub use api_client::{ApiClient, DeployApi, RemoteManifest};
pub use cancel_token::CancelToken;
pub use deploy_manager::DeployManager;
pub use download_manager::{DownloadManager, DownloadOutcome, ProgressFn};
pub use host::{HostShell, LocalHost};
pub use integrity_service::IntegrityService;
pub use manifest_service::ManifestService;
