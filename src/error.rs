use std::fmt;

use thiserror::Error;

/// Step of a backup, restore, listing or deletion in which an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A remote call issued outside any orchestrated operation.
    Remote,
    CheckSources,
    Authenticate,
    LocateRoot,
    CreateGroup,
    UploadDatabase,
    UploadAssets,
    Archive,
    ListGroups,
    ListMembers,
    Download,
    ReplaceDatabase,
    ReplaceAssets,
    Extract,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Remote => "remote call",
            Phase::CheckSources => "check backup sources",
            Phase::Authenticate => "authenticate",
            Phase::LocateRoot => "locate root folder",
            Phase::CreateGroup => "create group folder",
            Phase::UploadDatabase => "upload database",
            Phase::UploadAssets => "upload assets",
            Phase::Archive => "archive assets",
            Phase::ListGroups => "list groups",
            Phase::ListMembers => "list group members",
            Phase::Download => "download",
            Phase::ReplaceDatabase => "replace database",
            Phase::ReplaceAssets => "replace assets",
            Phase::Extract => "extract",
            Phase::Delete => "delete",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Authentication failed during {phase}: {message}")]
    Authentication { phase: Phase, message: String },

    #[error("Not found during {phase}: {message}")]
    NotFound { phase: Phase, message: String },

    #[error("Backup group {group_id} is incomplete: missing {missing}")]
    IncompleteBackup { group_id: String, missing: String },

    #[error("Remote store error during {phase}: {message}")]
    RemoteStore { phase: Phase, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error during {phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupError {
    /// Remote failure not yet attributed to an orchestration phase.
    pub fn remote(message: impl Into<String>) -> Self {
        BackupError::RemoteStore {
            phase: Phase::Remote,
            message: message.into(),
        }
    }

    /// Missing remote object, not yet attributed to an orchestration phase.
    pub fn not_found(message: impl Into<String>) -> Self {
        BackupError::NotFound {
            phase: Phase::Remote,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        BackupError::Authentication {
            phase: Phase::Authenticate,
            message: message.into(),
        }
    }

    pub fn io(phase: Phase, source: std::io::Error) -> Self {
        BackupError::Io { phase, source }
    }

    /// True for both a missing local path and an incomplete backup group.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackupError::NotFound { .. } | BackupError::IncompleteBackup { .. }
        )
    }

    /// Re-label remote, lookup, credential and IO errors with the phase
    /// they surfaced in.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            BackupError::RemoteStore { message, .. } => BackupError::RemoteStore { phase, message },
            BackupError::NotFound { message, .. } => BackupError::NotFound { phase, message },
            BackupError::Authentication { message, .. } => {
                BackupError::Authentication { phase, message }
            }
            BackupError::Io { source, .. } => BackupError::Io { phase, source },
            other => other,
        }
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Io {
            phase: Phase::Remote,
            source: err,
        }
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackupError::remote(format!("request timed out: {err}"))
        } else if err.is_connect() {
            BackupError::remote(format!("cannot connect: {err}"))
        } else {
            BackupError::remote(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::Archive(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Attach a [`Phase`] to the error side of a result.
pub trait PhaseContext<T> {
    fn phase(self, phase: Phase) -> Result<T>;
}

impl<T, E: Into<BackupError>> PhaseContext<T> for std::result::Result<T, E> {
    fn phase(self, phase: Phase) -> Result<T> {
        self.map_err(|e| e.into().in_phase(phase))
    }
}
