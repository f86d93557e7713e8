/// In-process storage backend.
///
/// Keeps folders and file bytes in a map and follows the same contract
/// as Google Drive: first-match folder lookup, no implicit recursive
/// folder deletion, newest-first ordering by creation time. Used by the
/// test suites and for dry runs without a Drive account.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use super::{ChildQuery, Properties, RemoteEntry, RemoteStore};
use crate::error::{BackupError, Result};

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<String>,
    is_folder: bool,
    data: Vec<u8>,
    created_time: DateTime<Utc>,
    /// Creation sequence, breaks ties between equal timestamps.
    seq: u64,
    properties: Properties,
}

/// Operation an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    CreateFolder,
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, Node>,
    next_id: u64,
    /// Fail the next matching call whose name (or id) ends with the suffix.
    failure: Option<(FailOn, String)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    /// Uploads and downloads pause this many times for this long, the way a
    /// chunked transfer makes several short requests.
    transfer_steps: Option<(u32, StdDuration)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transfer_steps(steps: u32, step: StdDuration) -> Self {
        Self {
            transfer_steps: Some((steps, step)),
            ..Self::default()
        }
    }

    async fn pace_transfer(&self) {
        if let Some((steps, step)) = self.transfer_steps {
            for _ in 0..steps {
                tokio::time::sleep(step).await;
            }
        }
    }

    /// Make the next `op` whose target name or id ends with `suffix` fail
    /// with a remote store error.
    pub fn fail_next(&self, op: FailOn, suffix: impl Into<String>) {
        self.lock().failure = Some((op, suffix.into()));
    }

    /// Bytes of a stored file.
    pub fn file_bytes(&self, id: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(id)
            .filter(|n| !n.is_folder)
            .map(|n| n.data.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().nodes.contains_key(id)
    }

    /// Number of folders with this exact name.
    pub fn folder_count(&self, name: &str) -> usize {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.is_folder && n.name == name)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, node: impl FnOnce(u64, DateTime<Utc>) -> Node) -> Result<String> {
        let mut state = self.lock();
        state.next_id += 1;
        let seq = state.next_id;
        // Deterministic, strictly increasing creation times.
        let created = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_else(Utc::now)
            + Duration::seconds(seq as i64);
        let id = format!("mem-{seq}");
        state.nodes.insert(id.clone(), node(seq, created));
        Ok(id)
    }

    fn check_failure(&self, op: FailOn, target: &str) -> Result<()> {
        let mut state = self.lock();
        let hit = matches!(&state.failure, Some((fail_op, suffix)) if *fail_op == op && target.ends_with(suffix.as_str()));
        if hit {
            state.failure = None;
            return Err(BackupError::remote(format!("injected {op:?} failure for {target}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>> {
        let state = self.lock();
        let mut matches: Vec<(&String, &Node)> = state
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.is_folder
                    && n.name == name
                    && parent_id.map_or(true, |p| n.parent.as_deref() == Some(p))
            })
            .collect();
        matches.sort_by_key(|(_, n)| n.seq);
        Ok(matches.first().map(|(id, _)| (*id).clone()))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        self.check_failure(FailOn::CreateFolder, name)?;
        if let Some(parent) = parent_id {
            if !self.lock().nodes.get(parent).is_some_and(|n| n.is_folder) {
                return Err(BackupError::not_found(format!("parent folder {parent}")));
            }
        }
        let name = name.to_string();
        let parent = parent_id.map(str::to_string);
        self.insert(|seq, created_time| Node {
            name,
            parent,
            is_folder: true,
            data: Vec::new(),
            created_time,
            seq,
            properties: Properties::new(),
        })
    }

    async fn list_children(&self, folder_id: &str, query: &ChildQuery) -> Result<Vec<RemoteEntry>> {
        // Like a Drive `in parents` query, an unknown folder has no children.
        let state = self.lock();
        let mut children: Vec<(&String, &Node)> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.as_deref() == Some(folder_id))
            .filter(|(_, n)| !query.folders_only || n.is_folder)
            .collect();

        children.sort_by_key(|(_, n)| n.seq);
        if query.newest_first {
            children.reverse();
        }

        Ok(children
            .into_iter()
            .take(query.limit)
            .map(|(id, n)| RemoteEntry {
                id: id.clone(),
                name: n.name.clone(),
                is_folder: n.is_folder,
                size: (!n.is_folder).then_some(n.data.len() as u64),
                created_time: Some(n.created_time),
                properties: n.properties.clone(),
            })
            .collect())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        parent_id: &str,
        properties: &Properties,
    ) -> Result<String> {
        self.check_failure(FailOn::Upload, remote_name)?;
        self.pace_transfer().await;
        if !self.lock().nodes.get(parent_id).is_some_and(|n| n.is_folder) {
            return Err(BackupError::not_found(format!("parent folder {parent_id}")));
        }

        let data = tokio::fs::read(local_path).await?;
        let name = remote_name.to_string();
        let parent = Some(parent_id.to_string());
        let properties = properties.clone();
        self.insert(|seq, created_time| Node {
            name,
            parent,
            is_folder: false,
            data,
            created_time,
            seq,
            properties,
        })
    }

    async fn download(&self, remote_id: &str, local_path: &Path) -> Result<u64> {
        self.check_failure(FailOn::Download, remote_id)?;
        self.pace_transfer().await;
        let data = self
            .file_bytes(remote_id)
            .ok_or_else(|| BackupError::not_found(format!("file {remote_id}")))?;
        tokio::fs::write(local_path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete_file(&self, remote_id: &str) -> Result<()> {
        self.check_failure(FailOn::Delete, remote_id)?;
        let mut state = self.lock();
        if state.nodes.values().any(|n| n.parent.as_deref() == Some(remote_id)) {
            return Err(BackupError::remote(format!("folder {remote_id} is not empty")));
        }
        state
            .nodes
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| BackupError::not_found(format!("file {remote_id}")))
    }

    async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.delete_file(folder_id).await
    }
}
