/// Restore coordinator for recovering a backup group.
///
/// The restore pipeline is the inverse of the backup pipeline:
/// 1. List the group's members and pick the database snapshot and the
///    asset archive
/// 2. Download both into a private scratch directory
/// 3. Check the archive opens (nothing live has been touched yet)
/// 4. Replace the live database file
/// 5. Wipe and recreate the asset directory, then extract the archive
///
/// The database is replaced before the assets. An interruption between
/// steps 4 and 5 leaves a restored database next to a partial asset tree;
/// running the restore again repairs it.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::archive;
use crate::backup::list_members;
use crate::backup::naming::MemberRole;
use crate::config::BackupSettings;
use crate::error::{BackupError, Phase, PhaseContext, Result};
use crate::storage::{RemoteEntry, RemoteStore};

/// Result of a complete restore operation.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub status: &'static str,
    pub message: String,
    pub group_id: String,
    /// Size of the restored database file.
    pub database_bytes: u64,
    /// Number of asset files extracted.
    pub files_restored: usize,
}

pub struct RestoreCoordinator {
    store: Arc<dyn RemoteStore>,
    settings: BackupSettings,
}

impl RestoreCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, settings: BackupSettings) -> Self {
        Self { store, settings }
    }

    /// Overwrite `db_path` and `assets_dir` with the contents of group
    /// `folder_id`.
    pub async fn restore_group(
        &self,
        folder_id: &str,
        db_path: &Path,
        assets_dir: &Path,
    ) -> Result<RestoreResult> {
        info!(store = self.store.name(), group_id = %folder_id, "Starting restore");

        let members = list_members(self.store.as_ref(), &self.settings, folder_id).await?;
        let database = pick_member(&members, MemberRole::Database, folder_id)?;
        let assets = pick_member(&members, MemberRole::Assets, folder_id)?;
        if members.len() > 2 {
            warn!(
                group_id = %folder_id,
                members = members.len(),
                "Group has extra members, ignoring them"
            );
        }

        // Removed on drop, whichever way this function exits.
        let scratch = tempfile::Builder::new()
            .prefix("backup_restore_")
            .tempdir_in(&self.settings.staging_dir)
            .phase(Phase::Download)?;
        let db_copy = scratch.path().join("database.db");
        let archive_copy = scratch.path().join("uploads.zip");

        let (database_bytes, archive_bytes) = tokio::try_join!(
            async {
                self.store
                    .download(&database.id, &db_copy)
                    .await
                    .phase(Phase::Download)
            },
            async {
                self.store
                    .download(&assets.id, &archive_copy)
                    .await
                    .phase(Phase::Download)
            },
        )?;
        info!(
            database = %database.name,
            database_bytes,
            archive = %assets.name,
            archive_bytes,
            "Group members downloaded"
        );

        let verify_path = archive_copy.clone();
        let entries = blocking(move || archive::verify_archive(&verify_path)).await?;

        replace_database(&db_copy, db_path)
            .await
            .phase(Phase::ReplaceDatabase)?;
        info!(path = %db_path.display(), "Database replaced");

        if tokio::fs::try_exists(assets_dir)
            .await
            .phase(Phase::ReplaceAssets)?
        {
            tokio::fs::remove_dir_all(assets_dir)
                .await
                .phase(Phase::ReplaceAssets)?;
        }
        tokio::fs::create_dir_all(assets_dir)
            .await
            .phase(Phase::ReplaceAssets)?;

        let dest: PathBuf = assets_dir.to_path_buf();
        let files_restored = blocking(move || archive::extract_archive(&archive_copy, &dest))
            .await
            .phase(Phase::Extract)?;
        info!(
            path = %assets_dir.display(),
            entries,
            files = files_restored,
            "Assets restored"
        );

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove restore scratch directory");
        }

        Ok(RestoreResult {
            status: "success",
            message: "Backup restored successfully".to_string(),
            group_id: folder_id.to_string(),
            database_bytes,
            files_restored,
        })
    }
}

fn pick_member<'a>(
    members: &'a [RemoteEntry],
    role: MemberRole,
    folder_id: &str,
) -> Result<&'a RemoteEntry> {
    role.find(members)
        .ok_or_else(|| BackupError::IncompleteBackup {
            group_id: folder_id.to_string(),
            missing: role.describe().to_string(),
        })
}

async fn replace_database(staged: &Path, live: &Path) -> std::io::Result<()> {
    if let Some(parent) = live.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(live).await? {
        tokio::fs::remove_file(live).await?;
    }
    tokio::fs::copy(staged, live).await?;
    Ok(())
}

/// Run archive work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BackupError::Archive(format!("archive task failed: {e}")))?
}
