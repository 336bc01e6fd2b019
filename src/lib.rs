//! Live update client: keeps a hybrid app's web assets in sync with a deploy channel.
//!
//! `DeployManager` is the entry point. Hosts plug in through the `PreferencesBridge`,
//! `FileTransport`, `HostShell` and `DeployApi` traits.

pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::DeployTuning;
pub use errors::{DeployError, Result};
pub use events::{DeployEvent, EventBus};
pub use services::{CancelToken, DeployManager};
