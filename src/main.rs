use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use imgvault::backup::BackupManager;
use imgvault::config::{self, BackupSettings, Config};
use imgvault::error::Result;
use imgvault::restore::RestoreCoordinator;
use imgvault::server::{self, AppState};
use imgvault::storage::auth::Authenticator;
use imgvault::storage::google_drive::GoogleDrive;
use imgvault::storage::RemoteStore;

#[derive(Parser)]
#[command(name = "imgvault")]
#[command(about = "Back up and restore the image service's database and uploads to Google Drive")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Live metadata database
    #[arg(long, env = "DB_PATH", default_value = config::DEFAULT_DB_PATH, global = true)]
    db_path: PathBuf,

    /// Live uploads directory
    #[arg(long, env = "UPLOAD_DIR", default_value = config::DEFAULT_UPLOAD_DIR, global = true)]
    upload_dir: PathBuf,

    /// Key required in the x-api-key header by `serve`
    #[arg(long, env = "API_KEY", default_value = config::DEFAULT_API_KEY, hide_env_values = true, global = true)]
    api_key: String,

    /// Google OAuth client JSON
    #[arg(long, env = "GOOGLE_OAUTH_CLIENT_FILE", default_value = config::DEFAULT_OAUTH_CLIENT_FILE, global = true)]
    oauth_client_file: PathBuf,

    /// Stored OAuth token JSON
    #[arg(long, env = "GOOGLE_OAUTH_TOKEN_FILE", default_value = config::DEFAULT_OAUTH_TOKEN_FILE, global = true)]
    oauth_token_file: PathBuf,

    /// Drive folder holding every backup group
    #[arg(long, env = "BACKUP_ROOT_FOLDER", default_value = config::DEFAULT_ROOT_FOLDER, global = true)]
    root_folder: String,

    /// Per-request remote timeout in seconds, 0 to disable
    #[arg(long, env = "BACKUP_TIMEOUT_SECS", default_value_t = 300, global = true)]
    timeout_secs: u64,

    /// Resumable upload chunk size in bytes (multiple of 256 KiB)
    #[arg(long, env = "BACKUP_CHUNK_SIZE", default_value_t = 8 * 1024 * 1024, global = true)]
    chunk_size: usize,

    /// Directory for temporary archives and restore scratch areas
    #[arg(long, env = "BACKUP_STAGING_DIR", global = true)]
    staging_dir: Option<PathBuf>,
}

impl Settings {
    fn into_config(self) -> Config {
        let defaults = BackupSettings::default();
        Config {
            db_path: self.db_path,
            upload_dir: self.upload_dir,
            api_key: self.api_key,
            oauth_client_file: self.oauth_client_file,
            oauth_token_file: self.oauth_token_file,
            backup: BackupSettings {
                root_folder_name: self.root_folder,
                remote_timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
                upload_chunk_size: self.chunk_size,
                staging_dir: self.staging_dir.unwrap_or(defaults.staging_dir),
                member_page_size: defaults.member_page_size,
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize access to Google Drive and store the token
    Auth,
    /// Back up the database and uploads into a new group
    Backup,
    /// List backup groups, newest first
    List {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Overwrite the live database and uploads from a group
    Restore { group_id: String },
    /// Delete a group and its files
    Delete { group_id: String },
    /// Serve the backup HTTP API
    Serve {
        #[arg(long, env = "IMGVAULT_ADDR", default_value = "127.0.0.1:8000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "imgvault failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.settings.into_config();
    config.validate()?;

    match cli.command {
        Commands::Auth => {
            let authenticator = authenticator(&config);
            authenticator
                .authorize_interactive(|url| {
                    eprintln!("Open this URL in a browser to authorize imgvault:\n\n  {url}\n");
                })
                .await?;
            print_json(&serde_json::json!({
                "status": "success",
                "message": format!("Token saved to {}", config.oauth_token_file.display()),
            }))
        }
        Commands::Backup => {
            let backups = BackupManager::new(connect(&config).await?, config.backup.clone());
            print_json(
                &backups
                    .create_full_backup(&config.db_path, &config.upload_dir)
                    .await?,
            )
        }
        Commands::List { limit } => {
            let backups = BackupManager::new(connect(&config).await?, config.backup.clone());
            print_json(&backups.list_groups(limit).await?)
        }
        Commands::Restore { group_id } => {
            let restorer = RestoreCoordinator::new(connect(&config).await?, config.backup.clone());
            print_json(
                &restorer
                    .restore_group(&group_id, &config.db_path, &config.upload_dir)
                    .await?,
            )
        }
        Commands::Delete { group_id } => {
            let backups = BackupManager::new(connect(&config).await?, config.backup.clone());
            print_json(&backups.delete_group(&group_id).await?)
        }
        Commands::Serve { addr } => {
            let store = connect(&config).await?;
            server::serve(AppState::new(store, config), &addr).await
        }
    }
}

fn authenticator(config: &Config) -> Authenticator {
    Authenticator::new(
        config.oauth_client_file.clone(),
        config.oauth_token_file.clone(),
    )
}

/// Open an authenticated Drive client.
async fn connect(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let session = Arc::new(authenticator(config).authenticate().await?);
    let drive = GoogleDrive::new(session, config.backup.upload_chunk_size)?
        .with_request_timeout(config.backup.remote_timeout);
    Ok(Arc::new(drive))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
