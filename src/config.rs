/// Runtime configuration shared by the CLI, the API server and the
/// backup components.
///
/// Defaults mirror the image service's own settings so that a bare
/// `imgvault backup` run from the service directory picks up the live
/// database and upload tree.
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BackupError, Result};

/// Name of the remote folder every backup group lives under.
pub const DEFAULT_ROOT_FOLDER: &str = "Anime Image Service Backups";

pub const DEFAULT_DB_PATH: &str = "data/images.db";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_OAUTH_CLIENT_FILE: &str = "google-oauth-client.json";
pub const DEFAULT_OAUTH_TOKEN_FILE: &str = "google-oauth-token.json";
pub const DEFAULT_API_KEY: &str = "this_is_random_key";

/// Resumable upload chunks must be a multiple of this size.
pub const UPLOAD_CHUNK_ALIGNMENT: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Live metadata store.
    pub db_path: PathBuf,
    /// Live asset (variant) directory.
    pub upload_dir: PathBuf,
    /// Key expected in the `x-api-key` header of backup routes.
    pub api_key: String,
    pub oauth_client_file: PathBuf,
    pub oauth_token_file: PathBuf,
    pub backup: BackupSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            api_key: DEFAULT_API_KEY.to_string(),
            oauth_client_file: PathBuf::from(DEFAULT_OAUTH_CLIENT_FILE),
            oauth_token_file: PathBuf::from(DEFAULT_OAUTH_TOKEN_FILE),
            backup: BackupSettings::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(BackupError::Config("API key must not be empty".into()));
        }
        self.backup.validate()
    }
}

/// Settings consumed by the backup manager, the restore coordinator and the
/// Drive client.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub root_folder_name: String,
    /// Deadline for one remote request (a listing page, an upload chunk, a
    /// folder create); `None` waits indefinitely.
    pub remote_timeout: Option<Duration>,
    /// Bytes sent per resumable upload request.
    pub upload_chunk_size: usize,
    /// Page size used when listing the members of a group.
    pub member_page_size: usize,
    /// Where temporary archives and restore scratch areas are created.
    pub staging_dir: PathBuf,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root_folder_name: DEFAULT_ROOT_FOLDER.to_string(),
            remote_timeout: Some(Duration::from_secs(300)),
            upload_chunk_size: 8 * 1024 * 1024, // 8 MiB
            member_page_size: 100,
            staging_dir: std::env::temp_dir(),
        }
    }
}

impl BackupSettings {
    pub fn validate(&self) -> Result<()> {
        if self.root_folder_name.trim().is_empty() {
            return Err(BackupError::Config("root folder name must not be empty".into()));
        }
        if self.upload_chunk_size == 0 || self.upload_chunk_size % UPLOAD_CHUNK_ALIGNMENT != 0 {
            return Err(BackupError::Config(format!(
                "upload chunk size must be a non-zero multiple of {UPLOAD_CHUNK_ALIGNMENT} bytes"
            )));
        }
        if self.member_page_size < 50 {
            return Err(BackupError::Config(
                "member page size must be at least 50".into(),
            ));
        }
        Ok(())
    }
}
