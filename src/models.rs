use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version id that stands for the assets shipped inside the binary.
pub const BUNDLE_VERSION_ID: &str = "bundle";

const DEFAULT_HOST: &str = "https://api.ionicjs.com";
const DEFAULT_MAX_VERSIONS: usize = 3;
const DEFAULT_MIN_BACKGROUND_DURATION_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateMethod {
    #[default]
    Background,
    Auto,
    None,
}

impl UpdateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMethod::Background => "background",
            UpdateMethod::Auto => "auto",
            UpdateMethod::None => "none",
        }
    }
}

impl FromStr for UpdateMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(UpdateMethod::Background),
            "auto" => Ok(UpdateMethod::Auto),
            "none" => Ok(UpdateMethod::None),
            other => Err(format!("unknown update method '{other}'")),
        }
    }
}

// Persisted records may carry values written by older hosts; anything unknown means background.
impl From<String> for UpdateMethod {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl From<UpdateMethod> for String {
    fn from(value: UpdateMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for UpdateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Available,
    Pending,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    pub version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub binary_version_name: String,
    #[serde(default)]
    pub binary_version_code: String,
    #[serde(default)]
    pub url: String,
    pub state: UpdateState,
    #[serde(default)]
    pub last_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ionic_version: Option<String>,
}

impl UpdateRecord {
    pub fn built_for(&self, binary_version_name: &str, binary_version_code: &str) -> bool {
        self.binary_version_name == binary_version_name
            && self.binary_version_code == binary_version_code
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub binary_version_name: String,
    #[serde(default)]
    pub binary_version_code: String,
    #[serde(default)]
    pub update_method: UpdateMethod,
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default = "default_min_background_duration")]
    pub min_background_duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version_for_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_update: Option<UpdateRecord>,
    #[serde(default)]
    pub updates: BTreeMap<String, UpdateRecord>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_max_versions() -> usize {
    DEFAULT_MAX_VERSIONS
}

fn default_min_background_duration() -> u64 {
    DEFAULT_MIN_BACKGROUND_DURATION_SECS
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            channel: String::new(),
            host: default_host(),
            debug: false,
            disabled: false,
            binary_version_name: String::new(),
            binary_version_code: String::new(),
            update_method: UpdateMethod::default(),
            max_versions: DEFAULT_MAX_VERSIONS,
            min_background_duration: DEFAULT_MIN_BACKGROUND_DURATION_SECS,
            current_version_id: None,
            current_version_for_app_id: None,
            current_build_id: None,
            available_update: None,
            updates: BTreeMap::new(),
        }
    }
}

impl Preferences {
    /// Snapshot id currently deployed, ignoring the bundle sentinel.
    pub fn deployed_version_id(&self) -> Option<&str> {
        self.current_version_id
            .as_deref()
            .filter(|id| *id != BUNDLE_VERSION_ID)
    }

    pub fn available_state(&self) -> Option<UpdateState> {
        self.available_update.as_ref().map(|update| update.state)
    }
}

/// Fields accepted by `configure`. Unknown or mistyped keys are rejected.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub update_method: Option<String>,
    #[serde(default)]
    pub max_versions: Option<usize>,
    #[serde(default)]
    pub min_background_duration: Option<u64>,
}

/// Preferences as exposed to callers, without the update catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentConfig {
    pub app_id: String,
    pub channel: String,
    pub host: String,
    pub debug: bool,
    pub disabled: bool,
    pub binary_version_name: String,
    pub binary_version_code: String,
    pub update_method: UpdateMethod,
    pub max_versions: usize,
    pub min_background_duration: u64,
    pub current_version_id: Option<String>,
    pub current_build_id: Option<String>,
}

impl From<&Preferences> for CurrentConfig {
    fn from(prefs: &Preferences) -> Self {
        Self {
            app_id: prefs.app_id.clone(),
            channel: prefs.channel.clone(),
            host: prefs.host.clone(),
            debug: prefs.debug,
            disabled: prefs.disabled,
            binary_version_name: prefs.binary_version_name.clone(),
            binary_version_code: prefs.binary_version_code.clone(),
            update_method: prefs.update_method,
            max_versions: prefs.max_versions,
            min_background_duration: prefs.min_background_duration,
            current_version_id: prefs.current_version_id.clone(),
            current_build_id: prefs.current_build_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub version_id: String,
    #[serde(default)]
    pub build_id: Option<String>,
    pub channel: String,
    pub binary_version_name: String,
    pub binary_version_code: String,
}

impl From<&UpdateRecord> for SnapshotInfo {
    fn from(update: &UpdateRecord) -> Self {
        Self {
            version_id: update.version_id.clone(),
            build_id: update.build_id.clone(),
            channel: update.channel.clone(),
            binary_version_name: update.binary_version_name.clone(),
            binary_version_code: update.binary_version_code.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub href: String,
    pub size: u64,
    pub integrity: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDeviceResponse {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub compatible: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CheckDeviceEnvelope {
    pub data: CheckDeviceResponse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDetails {
    pub binary_version: String,
    pub device_id: Option<String>,
    pub platform: String,
    pub platform_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckDeviceRequest {
    pub channel_name: String,
    pub app_id: String,
    pub device: DeviceDetails,
    pub plugin_version: String,
    pub manifest: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub platform: String,
    pub platform_version: String,
    #[serde(default)]
    pub device: Option<String>,
    pub data_directory: String,
    pub bundle_directory: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    pub update_method: Option<UpdateMethod>,
}
