/// Remote object-store abstraction for imgvault.
///
/// Backups are laid out as a small folder hierarchy on the remote side:
/// - one root folder (fixed name) holding every backup group
/// - one folder per group, named after its creation timestamp
/// - the group's member files (database snapshot, asset archive)
///
/// Backends only expose generic folder/file primitives. They never retry;
/// retry and timeout policy belong to the caller (see [`with_timeout`]).
pub mod auth;
pub mod google_drive;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Phase, Result};

/// MIME type Google Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Custom properties attached to an uploaded file.
pub type Properties = BTreeMap<String, String>;

/// A file or folder as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    /// Size in bytes (files only).
    pub size: Option<u64>,
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Properties,
}

/// Parameters of a child listing.
#[derive(Debug, Clone)]
pub struct ChildQuery {
    /// Only folders when set, every child otherwise.
    pub folders_only: bool,
    /// Newest first when set, backend order otherwise.
    pub newest_first: bool,
    /// Upper bound on returned entries. Backends page internally.
    pub limit: usize,
}

impl ChildQuery {
    pub fn folders_newest_first(limit: usize) -> Self {
        Self {
            folders_only: true,
            newest_first: true,
            limit,
        }
    }

    pub fn all(limit: usize) -> Self {
        Self {
            folders_only: false,
            newest_first: false,
            limit,
        }
    }
}

/// Folder/file capability over a remote object store.
///
/// Trashed entries are invisible to every query.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable name of this backend (e.g., "Google Drive").
    fn name(&self) -> &str;

    /// Find a folder by exact name. `parent_id = None` searches the whole
    /// store. When several match, the first one is returned.
    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>>;

    /// Create a folder and return its id.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String>;

    /// List the children of a folder.
    async fn list_children(&self, folder_id: &str, query: &ChildQuery) -> Result<Vec<RemoteEntry>>;

    /// Stream a local file into `parent_id` under `remote_name`. Returns the new file id.
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        parent_id: &str,
        properties: &Properties,
    ) -> Result<String>;

    /// Stream a remote file to `local_path`, replacing any existing file.
    async fn download(&self, remote_id: &str, local_path: &Path) -> Result<u64>;

    async fn delete_file(&self, remote_id: &str) -> Result<()>;

    /// Delete a folder. Children are not removed implicitly; callers delete
    /// them first.
    async fn delete_folder(&self, folder_id: &str) -> Result<()>;
}

/// Run a single-request remote call under an optional deadline, attributing
/// any failure (including the timeout itself) to `phase`.
///
/// Transfers are not wrapped: their backend bounds each request instead.
pub async fn with_timeout<T, F>(limit: Option<Duration>, phase: Phase, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackupError::remote(format!(
                "timed out after {}s",
                limit.as_secs_f64()
            ))),
        },
        None => call.await,
    };
    outcome.map_err(|e| e.in_phase(phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_is_a_remote_store_error() {
        let result: Result<()> = with_timeout(
            Some(Duration::from_millis(10)),
            Phase::Download,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        match result {
            Err(BackupError::RemoteStore { phase, message }) => {
                assert_eq!(phase, Phase::Download);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_without_limit_passes_value_through() {
        let value = with_timeout(None, Phase::Remote, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_errors_are_relabelled() {
        let result: Result<()> = with_timeout(None, Phase::Delete, async {
            Err(BackupError::remote("permission denied"))
        })
        .await;
        assert!(matches!(
            result,
            Err(BackupError::RemoteStore {
                phase: Phase::Delete,
                ..
            })
        ));
    }
}
