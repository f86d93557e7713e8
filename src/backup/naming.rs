/// Names and roles of backup groups and their members.
///
/// A group created at 2024-01-31 14:05:09 is laid out as:
/// - folder `backup_20240131_140509`
/// - member `images_db_20240131_140509.db` (role `database`)
/// - member `uploads_20240131_140509.zip` (role `assets`)
use chrono::NaiveDateTime;

use crate::storage::{Properties, RemoteEntry};

/// App property key recording a member's role.
pub const ROLE_PROPERTY: &str = "imgvault_role";

pub const DATABASE_SUFFIX: &str = ".db";
pub const ARCHIVE_SUFFIX: &str = ".zip";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Second-resolution timestamp shared by a group and its members.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupStamp(String);

impl GroupStamp {
    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self(at.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn group_name(&self) -> String {
        format!("backup_{}", self.0)
    }

    pub fn database_name(&self) -> String {
        format!("images_db_{}{DATABASE_SUFFIX}", self.0)
    }

    pub fn archive_name(&self) -> String {
        format!("uploads_{}{ARCHIVE_SUFFIX}", self.0)
    }
}

/// What a member file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Database,
    Assets,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Database => "database",
            MemberRole::Assets => "assets",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            MemberRole::Database => DATABASE_SUFFIX,
            MemberRole::Assets => ARCHIVE_SUFFIX,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            MemberRole::Database => "database snapshot",
            MemberRole::Assets => "asset archive",
        }
    }

    /// Properties to attach when uploading a member with this role.
    pub fn properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(ROLE_PROPERTY.to_string(), self.as_str().to_string());
        props
    }

    /// Pick the member holding this role: an entry tagged with the role
    /// wins, otherwise the first untagged entry whose name has the role's
    /// suffix (groups written before members were tagged).
    pub fn find<'a>(&self, entries: &'a [RemoteEntry]) -> Option<&'a RemoteEntry> {
        let files = || entries.iter().filter(|e| !e.is_folder);
        files()
            .find(|e| e.properties.get(ROLE_PROPERTY).map(String::as_str) == Some(self.as_str()))
            .or_else(|| {
                files().find(|e| {
                    !e.properties.contains_key(ROLE_PROPERTY) && e.name.ends_with(self.suffix())
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn entry(id: &str, name: &str, role: Option<MemberRole>) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            is_folder: false,
            size: Some(1),
            created_time: None,
            properties: role.map(|r| r.properties()).unwrap_or_default(),
        }
    }

    #[test]
    fn test_names_follow_layout() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        let stamp = GroupStamp::from_datetime(at);
        assert_eq!(stamp.as_str(), "20240131_140509");
        assert_eq!(stamp.group_name(), "backup_20240131_140509");
        assert_eq!(stamp.database_name(), "images_db_20240131_140509.db");
        assert_eq!(stamp.archive_name(), "uploads_20240131_140509.zip");
    }

    #[test]
    fn test_tagged_member_wins_over_suffix() {
        let entries = vec![
            entry("1", "notes.db", None),
            entry("2", "snapshot.bin", Some(MemberRole::Database)),
        ];
        assert_eq!(MemberRole::Database.find(&entries).unwrap().id, "2");
    }

    #[test]
    fn test_suffix_fallback_takes_first_match() {
        let entries = vec![
            entry("1", "uploads_a.zip", None),
            entry("2", "uploads_b.zip", None),
            entry("3", "images_db_a.db", None),
        ];
        assert_eq!(MemberRole::Assets.find(&entries).unwrap().id, "1");
        assert_eq!(MemberRole::Database.find(&entries).unwrap().id, "3");
    }

    #[test]
    fn test_tagged_entry_is_not_reused_for_other_role() {
        // Tagged as assets, but named like a database snapshot.
        let entries = vec![entry("1", "odd.db", Some(MemberRole::Assets))];
        assert!(MemberRole::Database.find(&entries).is_none());
    }

    #[test]
    fn test_missing_member() {
        let entries = vec![entry("1", "images_db_a.db", None)];
        assert!(MemberRole::Assets.find(&entries).is_none());
    }
}
