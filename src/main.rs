use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use live_update::errors::{DeployError, Result};
use live_update::logging;
use live_update::models::{AppInfo, Preferences, SyncOptions, UpdateMethod};
use live_update::services::{ApiClient, CancelToken, DeployManager, LocalHost, ProgressFn};
use live_update::store::{JsonFilePreferences, PreferencesStore};
use live_update::utils::file::LocalFileTransport;
use live_update::utils::paths::resolve_log_dir;
use live_update::DeployTuning;

const PREFS_FILE: &str = "live-update-prefs.json";
const SERVER_PATH_FILE: &str = "server-base-path";

#[derive(Parser)]
#[command(name = "live-update")]
#[command(about = "Keeps an app's web assets in sync with its deploy channel", long_about = None)]
#[command(version)]
struct Cli {
    /// Writable directory holding snapshots, preferences and logs
    #[arg(long, global = true, default_value = "./live-update-data")]
    data_dir: PathBuf,

    /// Read-only directory with the web assets shipped in the binary
    #[arg(long, global = true, default_value = "./www")]
    bundle_dir: PathBuf,

    /// Preferences file (defaults to <data-dir>/live-update-prefs.json)
    #[arg(long, global = true)]
    prefs: Option<PathBuf>,

    /// Log directory (overrides $LIVE_UPDATE_LOG_DIR)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Echo more of the log on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true, default_value = "android")]
    platform: String,

    #[arg(long, global = true, default_value = "")]
    platform_version: String,

    #[arg(long, global = true)]
    device_id: Option<String>,

    /// Version name of the running native binary
    #[arg(long, global = true, default_value = "1.0.0")]
    binary_version: String,

    /// Version code of the running native binary
    #[arg(long, global = true, default_value = "1")]
    binary_code: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the startup sequence and wait for any background sync
    Start,

    /// Ask the deploy server whether an update is available
    Check,

    /// Check, download and extract the latest update
    Sync {
        /// Activate the update once it is ready
        #[arg(long)]
        auto: bool,
    },

    /// List downloaded versions
    Versions,

    /// Delete a downloaded version
    Delete { version_id: String },

    /// Drop every snapshot and serve the bundled assets
    Reset,

    /// Merge a JSON object into the preferences
    Configure { json: String },

    /// Print the current configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| resolve_log_dir(&cli.data_dir));
    let logging_on = match logging::init(&log_dir, logging::console_level(cli.verbose)) {
        Ok(()) => true,
        Err(err) => {
            eprintln!("logging disabled: {}", err);
            false
        }
    };

    if let Err(err) = run(cli).await {
        tracing::error!("command failed: {}", err);
        if !logging_on {
            eprintln!("error: {}", err);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let manager = build_manager(&cli).await?;

    match cli.command {
        Commands::Start => {
            manager.start().await;
            manager.wait_for_background_sync().await;
            print_json(&manager.get_current_version().await?)
        }
        Commands::Check => print_json(&manager.check_for_update().await?),
        Commands::Sync { auto } => {
            let cancel = CancelToken::new();
            watch_ctrl_c(cancel.clone(), DeployTuning::from_env());
            let progress: ProgressFn = Arc::new(|percent: u8| eprintln!("progress {}%", percent));
            let options = SyncOptions {
                update_method: auto.then_some(UpdateMethod::Auto),
            };
            let snapshot = manager.sync(options, &cancel, Some(progress)).await?;
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            print_json(&snapshot)
        }
        Commands::Versions => print_json(&manager.get_available_versions().await),
        Commands::Delete { version_id } => {
            print_json(&manager.delete_version_by_id(&version_id).await?)
        }
        Commands::Reset => print_json(&manager.reset_to_bundle().await?),
        Commands::Configure { json } => {
            let value: serde_json::Value = serde_json::from_str(&json)
                .map_err(|err| DeployError::InvalidConfig(err.to_string()))?;
            manager.configure(value).await?;
            print_json(&manager.get_configuration().await)
        }
        Commands::Config => print_json(&manager.get_configuration().await),
    }
}

async fn build_manager(cli: &Cli) -> Result<DeployManager> {
    tokio::fs::create_dir_all(&cli.data_dir).await?;
    let data_dir = absolute(&cli.data_dir)?;
    let bundle_dir = absolute(&cli.bundle_dir)?;

    let app_info = AppInfo {
        platform: cli.platform.clone(),
        platform_version: cli.platform_version.clone(),
        device: cli.device_id.clone(),
        data_directory: data_dir.to_string_lossy().to_string(),
        bundle_directory: bundle_dir.to_string_lossy().to_string(),
    };

    let prefs_path = cli
        .prefs
        .clone()
        .unwrap_or_else(|| data_dir.join(PREFS_FILE));
    let defaults = Preferences {
        binary_version_name: cli.binary_version.clone(),
        binary_version_code: cli.binary_code.clone(),
        ..Preferences::default()
    };
    let store = PreferencesStore::load(Arc::new(JsonFilePreferences::new(prefs_path, defaults)))
        .await?;

    let stored = store.snapshot().await;
    if stored.binary_version_name != cli.binary_version
        || stored.binary_version_code != cli.binary_code
    {
        let (name, code) = (cli.binary_version.clone(), cli.binary_code.clone());
        store
            .update(move |prefs| {
                prefs.binary_version_name = name;
                prefs.binary_version_code = code;
            })
            .await?;
    }

    let files = Arc::new(LocalFileTransport::new(data_dir.clone(), bundle_dir));
    let host =
        Arc::new(LocalHost::with_state_file(app_info, data_dir.join(SERVER_PATH_FILE)).await);
    let api = Arc::new(ApiClient::new());

    DeployManager::new(store, files, host, api, DeployTuning::from_env()).await
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn watch_ctrl_c(cancel: CancelToken, tuning: DeployTuning) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling, waiting for in-flight files");
            cancel.request_cancel(
                || tracing::info!("sync cancelled by user"),
                tuning.cancel_backstop,
            );
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
