/// Backup group manager.
///
/// Coordinates the full backup flow:
/// 1. Check the live database file and asset directory exist
/// 2. Locate (or create) the root backup folder, cached per manager
/// 3. Create a timestamped group folder under the root
/// 4. Upload the database snapshot (the asset archive is built meanwhile)
/// 5. Upload the asset archive, then drop the local staging copy
///
/// A failure after step 3 leaves an incomplete group on the remote side.
/// It stays listable, is reported as not restorable, and can be removed
/// with [`BackupManager::delete_group`].
pub mod naming;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::archive::{self, ArchiveInfo};
use crate::config::BackupSettings;
use crate::error::{BackupError, Phase, PhaseContext, Result};
use crate::storage::{with_timeout, ChildQuery, RemoteEntry, RemoteStore};
use naming::{GroupStamp, MemberRole};

/// Name and remote id of an uploaded member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRef {
    pub name: String,
    pub id: String,
}

/// Result of a successful full backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupGroupDescriptor {
    pub group_name: String,
    pub group_id: String,
    pub database: MemberRef,
    pub uploads: MemberRef,
    pub timestamp: String,
}

/// A file inside a listed group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
}

impl From<RemoteEntry> for GroupMember {
    fn from(entry: RemoteEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            size: entry.size,
        }
    }
}

/// One group as reported by [`BackupManager::list_groups`].
#[derive(Debug, Clone, Serialize)]
pub struct BackupGroupSummary {
    pub folder_id: String,
    pub folder_name: String,
    pub created_time: Option<DateTime<Utc>>,
    pub members: Vec<GroupMember>,
    /// Both the database snapshot and the asset archive are present.
    pub restorable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupListing {
    pub total: usize,
    pub groups: Vec<BackupGroupSummary>,
}

/// Plain status record returned by mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationStatus {
    pub status: &'static str,
    pub message: String,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
        }
    }
}

/// Creates, lists and deletes backup groups under the root folder.
pub struct BackupManager {
    store: Arc<dyn RemoteStore>,
    settings: BackupSettings,
    root_folder_id: OnceCell<String>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn RemoteStore>, settings: BackupSettings) -> Self {
        Self {
            store,
            settings,
            root_folder_id: OnceCell::new(),
        }
    }

    /// Id of the root backup folder, looked up (or created) on first use.
    ///
    /// Lookup-then-create is not atomic: two processes starting at once
    /// may both create a root. Lookups take the first match, so later runs
    /// converge on one of them.
    pub async fn root_folder_id(&self) -> Result<&str> {
        self.root_folder_id
            .get_or_try_init(|| self.locate_root())
            .await
            .map(String::as_str)
    }

    async fn locate_root(&self) -> Result<String> {
        let name = &self.settings.root_folder_name;
        let timeout = self.settings.remote_timeout;

        if let Some(id) =
            with_timeout(timeout, Phase::LocateRoot, self.store.find_folder(name, None)).await?
        {
            info!(store = self.store.name(), root_folder = %name, folder_id = %id, "Found backup root folder");
            return Ok(id);
        }

        let id = with_timeout(timeout, Phase::LocateRoot, self.store.create_folder(name, None)).await?;
        info!(store = self.store.name(), root_folder = %name, folder_id = %id, "Created backup root folder");
        Ok(id)
    }

    /// Back up `db_path` and `assets_dir` into a new group stamped with the
    /// current local time.
    pub async fn create_full_backup(
        &self,
        db_path: &Path,
        assets_dir: &Path,
    ) -> Result<BackupGroupDescriptor> {
        self.create_full_backup_at(db_path, assets_dir, Local::now().naive_local())
            .await
    }

    /// Same as [`create_full_backup`](Self::create_full_backup) with an
    /// explicit group timestamp.
    pub async fn create_full_backup_at(
        &self,
        db_path: &Path,
        assets_dir: &Path,
        at: NaiveDateTime,
    ) -> Result<BackupGroupDescriptor> {
        if !db_path.is_file() {
            return Err(BackupError::NotFound {
                phase: Phase::CheckSources,
                message: format!("database {}", db_path.display()),
            });
        }
        if !assets_dir.is_dir() {
            return Err(BackupError::NotFound {
                phase: Phase::CheckSources,
                message: format!("uploads directory {}", assets_dir.display()),
            });
        }

        let timeout = self.settings.remote_timeout;
        let root_id = self.root_folder_id().await?.to_string();
        let stamp = GroupStamp::from_datetime(at);
        let group_name = stamp.group_name();

        let existing = with_timeout(
            timeout,
            Phase::CreateGroup,
            self.store.find_folder(&group_name, Some(&root_id)),
        )
        .await?;
        if existing.is_some() {
            return Err(BackupError::RemoteStore {
                phase: Phase::CreateGroup,
                message: format!("backup group {group_name} already exists"),
            });
        }

        let group_id = with_timeout(
            timeout,
            Phase::CreateGroup,
            self.store.create_folder(&group_name, Some(&root_id)),
        )
        .await?;
        info!(group = %group_name, group_id = %group_id, "Created backup group");

        match self.upload_members(&stamp, &group_id, db_path, assets_dir).await {
            Ok((database, uploads)) => {
                info!(
                    group = %group_name,
                    database_id = %database.id,
                    uploads_id = %uploads.id,
                    "Full backup complete"
                );
                Ok(BackupGroupDescriptor {
                    group_name,
                    group_id,
                    database,
                    uploads,
                    timestamp: stamp.as_str().to_string(),
                })
            }
            Err(e) => {
                warn!(
                    group = %group_name,
                    group_id = %group_id,
                    error = %e,
                    "Backup failed after group creation, group left incomplete"
                );
                Err(e)
            }
        }
    }

    async fn upload_members(
        &self,
        stamp: &GroupStamp,
        group_id: &str,
        db_path: &Path,
        assets_dir: &Path,
    ) -> Result<(MemberRef, MemberRef)> {
        // Removed on drop, whichever way this function exits.
        let staging = tempfile::Builder::new()
            .prefix("imgvault_backup_")
            .tempdir_in(&self.settings.staging_dir)
            .phase(Phase::Archive)?;
        let archive_path = staging.path().join(stamp.archive_name());

        let database_name = stamp.database_name();
        let database_props = MemberRole::Database.properties();
        // Transfers carry a per-request deadline inside the backend, so a
        // large file is never capped as a whole.
        let upload_database = async {
            self.store
                .upload(db_path, &database_name, group_id, &database_props)
                .await
                .phase(Phase::UploadDatabase)
        };
        let (database_id, archive) = tokio::try_join!(
            upload_database,
            build_archive(assets_dir.to_path_buf(), archive_path)
        )?;
        info!(
            files = archive.files,
            bytes = archive.compressed_size,
            "Asset archive built"
        );

        let archive_name = stamp.archive_name();
        let assets_props = MemberRole::Assets.properties();
        let uploads_id = self
            .store
            .upload(&archive.path, &archive_name, group_id, &assets_props)
            .await
            .phase(Phase::UploadAssets)?;

        if let Err(e) = staging.close() {
            warn!(error = %e, "Failed to remove backup staging directory");
        }

        Ok((
            MemberRef {
                name: database_name,
                id: database_id,
            },
            MemberRef {
                name: archive_name,
                id: uploads_id,
            },
        ))
    }

    /// Up to `limit` groups, newest first, each with its member files.
    pub async fn list_groups(&self, limit: usize) -> Result<GroupListing> {
        if limit == 0 {
            return Ok(GroupListing {
                total: 0,
                groups: Vec::new(),
            });
        }

        let root_id = self.root_folder_id().await?.to_string();
        let folders = with_timeout(
            self.settings.remote_timeout,
            Phase::ListGroups,
            self.store
                .list_children(&root_id, &ChildQuery::folders_newest_first(limit)),
        )
        .await?;

        let mut groups = Vec::with_capacity(folders.len());
        for folder in folders {
            let members = list_members(self.store.as_ref(), &self.settings, &folder.id).await?;
            let restorable = MemberRole::Database.find(&members).is_some()
                && MemberRole::Assets.find(&members).is_some();

            groups.push(BackupGroupSummary {
                folder_id: folder.id,
                folder_name: folder.name,
                created_time: folder.created_time,
                members: members.into_iter().map(GroupMember::from).collect(),
                restorable,
            });
        }

        Ok(GroupListing {
            total: groups.len(),
            groups,
        })
    }

    /// Delete every member of a group, then the group folder.
    ///
    /// Not transactional. After a failure, calling again finishes the job.
    pub async fn delete_group(&self, folder_id: &str) -> Result<OperationStatus> {
        let timeout = self.settings.remote_timeout;
        let mut deleted = 0usize;

        loop {
            let members = list_members(self.store.as_ref(), &self.settings, folder_id).await?;
            if members.is_empty() {
                break;
            }
            for member in &members {
                with_timeout(timeout, Phase::Delete, self.store.delete_file(&member.id)).await?;
                deleted += 1;
            }
        }

        with_timeout(timeout, Phase::Delete, self.store.delete_folder(folder_id)).await?;
        info!(group_id = %folder_id, members = deleted, "Deleted backup group");

        Ok(OperationStatus::success("Backup group deleted"))
    }
}

/// All non-trashed children of a group folder, up to the member page size.
pub(crate) async fn list_members(
    store: &dyn RemoteStore,
    settings: &BackupSettings,
    folder_id: &str,
) -> Result<Vec<RemoteEntry>> {
    with_timeout(
        settings.remote_timeout,
        Phase::ListMembers,
        store.list_children(folder_id, &ChildQuery::all(settings.member_page_size)),
    )
    .await
}

/// Build the asset archive on the blocking pool.
async fn build_archive(source: PathBuf, target: PathBuf) -> Result<ArchiveInfo> {
    tokio::task::spawn_blocking(move || archive::archive_directory(&source, &target))
        .await
        .map_err(|e| BackupError::Archive(format!("archive task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FailOn, MemoryStore};
    use chrono::NaiveDate;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        staging: TempDir,
        db_path: PathBuf,
        assets_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data/images.db");
        let assets_dir = dir.path().join("uploads");
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        fs::write(&db_path, vec![0x53u8; 10 * 1024]).unwrap();
        fs::create_dir_all(assets_dir.join("w300")).unwrap();
        fs::create_dir_all(assets_dir.join("w780")).unwrap();
        fs::write(assets_dir.join("w300/a.webp"), vec![1u8; 2 * 1024]).unwrap();
        fs::write(assets_dir.join("w780/a.webp"), vec![2u8; 5 * 1024]).unwrap();

        Fixture {
            dir,
            staging: tempfile::tempdir().unwrap(),
            db_path,
            assets_dir,
        }
    }

    fn manager(store: &Arc<MemoryStore>, staging: &Path) -> BackupManager {
        let settings = BackupSettings {
            staging_dir: staging.to_path_buf(),
            ..Default::default()
        };
        BackupManager::new(store.clone(), settings)
    }

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(14, 5, second)
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_backup_descriptor_and_archive_contents() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let desc = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(9))
            .await
            .unwrap();

        assert_eq!(desc.group_name, "backup_20240131_140509");
        assert_eq!(desc.timestamp, "20240131_140509");
        assert_eq!(desc.database.name, "images_db_20240131_140509.db");
        assert!(desc.uploads.name.ends_with(".zip"));
        assert_eq!(
            store.file_bytes(&desc.database.id).unwrap(),
            fs::read(&fx.db_path).unwrap()
        );

        let archive_path = fx.dir.path().join("check.zip");
        fs::write(&archive_path, store.file_bytes(&desc.uploads.id).unwrap()).unwrap();
        let out = fx.dir.path().join("extracted");
        fs::create_dir_all(&out).unwrap();
        assert_eq!(archive::extract_archive(&archive_path, &out).unwrap(), 2);
        assert_eq!(fs::metadata(out.join("w300/a.webp")).unwrap().len(), 2048);
        assert_eq!(fs::metadata(out.join("w780/a.webp")).unwrap().len(), 5120);

        // The staging archive does not outlive the backup.
        assert_eq!(fs::read_dir(fx.staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_database_fails_before_any_remote_call() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let err = backups
            .create_full_backup_at(&fx.dir.path().join("nope.db"), &fx.assets_dir, at(0))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::NotFound {
                phase: Phase::CheckSources,
                ..
            }
        ));
        assert_eq!(store.folder_count(crate::config::DEFAULT_ROOT_FOLDER), 0);
    }

    #[tokio::test]
    async fn test_missing_assets_dir_is_not_found() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let err = backups
            .create_full_backup_at(&fx.db_path, &fx.dir.path().join("missing"), at(0))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_root_folder_is_reused_and_names_are_distinct() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let first = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(1))
            .await
            .unwrap();
        let second = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(2))
            .await
            .unwrap();

        assert_ne!(first.group_name, second.group_name);
        assert_ne!(first.group_id, second.group_id);
        assert_eq!(store.folder_count(crate::config::DEFAULT_ROOT_FOLDER), 1);
    }

    #[tokio::test]
    async fn test_existing_root_folder_is_found_not_recreated() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let existing = store
            .create_folder(crate::config::DEFAULT_ROOT_FOLDER, None)
            .await
            .unwrap();

        let backups = manager(&store, fx.staging.path());
        assert_eq!(backups.root_folder_id().await.unwrap(), existing);
        assert_eq!(store.folder_count(crate::config::DEFAULT_ROOT_FOLDER), 1);
    }

    #[tokio::test]
    async fn test_same_second_backup_is_rejected() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(5))
            .await
            .unwrap();
        let err = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::RemoteStore {
                phase: Phase::CreateGroup,
                ..
            }
        ));
        assert_eq!(backups.list_groups(10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_failed_asset_upload_leaves_partial_group_and_no_staging_files() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        store.fail_next(FailOn::Upload, ".zip");
        let err = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(3))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::RemoteStore {
                phase: Phase::UploadAssets,
                ..
            }
        ));
        assert_eq!(fs::read_dir(fx.staging.path()).unwrap().count(), 0);

        let listing = backups.list_groups(10).await.unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.groups[0].members.len(), 1);
        assert!(!listing.groups[0].restorable);
    }

    #[tokio::test]
    async fn test_list_groups_newest_first_with_limit() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        for second in [10, 11, 12] {
            backups
                .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(second))
                .await
                .unwrap();
        }

        let listing = backups.list_groups(2).await.unwrap();
        assert_eq!(listing.total, 2);
        assert_eq!(listing.groups[0].folder_name, "backup_20240131_140512");
        assert_eq!(listing.groups[1].folder_name, "backup_20240131_140511");
        assert!(listing.groups[0].created_time > listing.groups[1].created_time);
        assert!(listing.groups.iter().all(|g| g.restorable && g.members.len() == 2));
    }

    #[tokio::test]
    async fn test_list_groups_when_empty() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let listing = backups.list_groups(10).await.unwrap();
        assert_eq!(listing.total, 0);
        assert!(listing.groups.is_empty());
        assert_eq!(backups.list_groups(0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_deleted_group_is_no_longer_listed() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let keep = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(20))
            .await
            .unwrap();
        let doomed = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(21))
            .await
            .unwrap();

        let status = backups.delete_group(&doomed.group_id).await.unwrap();
        assert_eq!(status.status, "success");
        assert!(!store.exists(&doomed.database.id));
        assert!(!store.exists(&doomed.group_id));

        let ids: Vec<String> = backups
            .list_groups(10)
            .await
            .unwrap()
            .groups
            .into_iter()
            .map(|g| g.folder_id)
            .collect();
        assert_eq!(ids, vec![keep.group_id]);
    }

    #[tokio::test]
    async fn test_interrupted_delete_can_be_repeated() {
        let fx = fixture();
        let store = Arc::new(MemoryStore::new());
        let backups = manager(&store, fx.staging.path());

        let desc = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(30))
            .await
            .unwrap();

        store.fail_next(FailOn::Delete, desc.group_id.clone());
        let err = backups.delete_group(&desc.group_id).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::RemoteStore {
                phase: Phase::Delete,
                ..
            }
        ));
        // Members are gone, the empty folder remains.
        assert!(store.exists(&desc.group_id));
        assert!(!store.exists(&desc.uploads.id));

        backups.delete_group(&desc.group_id).await.unwrap();
        assert!(!store.exists(&desc.group_id));
    }

    #[tokio::test]
    async fn test_long_transfer_is_not_capped_by_the_call_timeout() {
        let fx = fixture();
        // Each transfer takes 240 ms in 40 ms steps.
        let store = Arc::new(MemoryStore::with_transfer_steps(6, Duration::from_millis(40)));
        let settings = BackupSettings {
            staging_dir: fx.staging.path().to_path_buf(),
            remote_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let backups = BackupManager::new(store.clone(), settings);

        let desc = backups
            .create_full_backup_at(&fx.db_path, &fx.assets_dir, at(40))
            .await
            .unwrap();

        assert_eq!(
            store.file_bytes(&desc.database.id).unwrap(),
            fs::read(&fx.db_path).unwrap()
        );
        assert!(store.exists(&desc.uploads.id));
    }
}
