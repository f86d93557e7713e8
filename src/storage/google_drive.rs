/// Google Drive storage backend.
///
/// Uses the Google Drive API v3 for:
/// - folder lookup and listing via files.list (trash-aware queries)
/// - folder creation via files.create
/// - resumable, chunked uploads (uploadType=resumable)
/// - streamed downloads via files.get with alt=media
///
/// Every request carries the bearer token of the shared [`DriveSession`].
/// The optional request timeout bounds each HTTP exchange on its own, so a
/// transfer of many chunks may run longer than the limit as a whole.
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::auth::DriveSession;
use super::{ChildQuery, Properties, RemoteEntry, RemoteStore, FOLDER_MIME_TYPE};
use crate::config::UPLOAD_CHUNK_ALIGNMENT;
use crate::error::{BackupError, Result};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Largest page files.list accepts.
const MAX_PAGE_SIZE: usize = 1000;

const ENTRY_FIELDS: &str = "id,name,mimeType,size,createdTime,appProperties";

/// Google Drive backend.
pub struct GoogleDrive {
    client: Client,
    session: Arc<DriveSession>,
    api_base: String,
    upload_base: String,
    chunk_size: usize,
    request_timeout: Option<Duration>,
}

impl GoogleDrive {
    pub fn new(session: Arc<DriveSession>, chunk_size: usize) -> Result<Self> {
        Self::with_endpoints(session, chunk_size, DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    /// Point the client at alternative API hosts (used against local fakes).
    pub fn with_endpoints(
        session: Arc<DriveSession>,
        chunk_size: usize,
        api_base: &str,
        upload_base: &str,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_size % UPLOAD_CHUNK_ALIGNMENT != 0 {
            return Err(BackupError::Config(format!(
                "upload chunk size must be a non-zero multiple of {UPLOAD_CHUNK_ALIGNMENT} bytes"
            )));
        }

        // Drive answers an unfinished resumable upload with 308, which must
        // not be treated as a redirect.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            session,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            chunk_size,
            request_timeout: None,
        })
    }

    /// Bound every request (and every idle gap in a download body) by `limit`.
    pub fn with_request_timeout(mut self, limit: Option<Duration>) -> Self {
        self.request_timeout = limit;
        self
    }

    /// Run one HTTP exchange under the request timeout.
    async fn bounded<T, F>(&self, action: &str, exchange: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(limit) = self.request_timeout else {
            return exchange.await;
        };
        tokio::time::timeout(limit, exchange).await.map_err(|_| {
            BackupError::remote(format!(
                "{action} timed out after {}s",
                limit.as_secs_f64()
            ))
        })?
    }

    async fn token(&self) -> Result<String> {
        self.session.access_token().await
    }

    async fn list_page(
        &self,
        query: &str,
        page_size: usize,
        order_by: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<FileListResponse> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE).to_string();
        let fields = format!("nextPageToken,files({ENTRY_FIELDS})");
        let mut params = vec![
            ("q", query),
            ("spaces", "drive"),
            ("fields", fields.as_str()),
            ("pageSize", page_size.as_str()),
        ];
        if let Some(order_by) = order_by {
            params.push(("orderBy", order_by));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let request = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(self.token().await?)
            .query(&params);
        self.bounded("list files", async {
            let resp = ensure_success(request.send().await?, "list files").await?;
            Ok::<_, BackupError>(resp.json().await?)
        })
        .await
    }

    /// Open a resumable upload session and return its URI.
    async fn start_resumable_upload(
        &self,
        remote_name: &str,
        parent_id: &str,
        properties: &Properties,
        total: u64,
    ) -> Result<String> {
        let mut metadata = json!({ "name": remote_name, "parents": [parent_id] });
        if !properties.is_empty() {
            metadata["appProperties"] = json!(properties);
        }

        let request = self
            .client
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(self.token().await?)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", total.to_string())
            .json(&metadata);
        let resp = self
            .bounded("start upload", async {
                ensure_success(request.send().await?, "start upload").await
            })
            .await?;

        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::remote("resumable upload session has no Location header"))
    }

    /// Send one chunk. Returns the file id once Drive reports completion,
    /// otherwise the offset Drive has persisted so far.
    async fn put_chunk(
        &self,
        session_uri: &str,
        chunk: Vec<u8>,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome> {
        let range = if total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {}-{}/{}", offset, offset + chunk.len() as u64 - 1, total)
        };

        let request = self
            .client
            .put(session_uri)
            .bearer_auth(self.token().await?)
            .header(CONTENT_LENGTH, chunk.len().to_string())
            .header(CONTENT_RANGE, range)
            .body(chunk);

        self.bounded("upload chunk", async {
            let resp = request.send().await?;
            if resp.status() == StatusCode::PERMANENT_REDIRECT {
                // "Resume Incomplete": Range is the inclusive span stored so far.
                let persisted = resp
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_persisted_range)
                    .unwrap_or(0);
                return Ok::<_, BackupError>(ChunkOutcome::Incomplete(persisted));
            }

            let resp = ensure_success(resp, "upload chunk").await?;
            let created: CreatedFile = resp.json().await?;
            Ok(ChunkOutcome::Complete(created.id))
        })
        .await
    }
}

enum ChunkOutcome {
    Incomplete(u64),
    Complete(String),
}

/// files.list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// File metadata from Google Drive API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    mime_type: Option<String>,
    /// Drive encodes int64 fields as strings.
    size: Option<String>,
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    app_properties: Properties,
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        RemoteEntry {
            is_folder: file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE),
            size: file.size.and_then(|s| s.parse().ok()),
            id: file.id,
            name: file.name,
            created_time: file.created_time,
            properties: file.app_properties,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// Quote a value for a Drive query string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `Range: bytes=0-524287` → 524288 bytes persisted.
fn parse_persisted_range(header: &str) -> Option<u64> {
    let (_, end) = header.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.parse::<u64>().ok().map(|end| end + 1)
}

/// Map a non-success response to an error carrying status and body.
async fn ensure_success(resp: Response, action: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(BackupError::not_found(format!("{action}: {body}")));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(BackupError::auth(format!("{action} ({status}): {body}")));
    }
    Err(BackupError::remote(format!("{action} failed ({status}): {body}")))
}

#[async_trait]
impl RemoteStore for GoogleDrive {
    fn name(&self) -> &str {
        "Google Drive"
    }

    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>> {
        let mut query = format!(
            "name={} and mimeType='{FOLDER_MIME_TYPE}' and trashed=false",
            quote(name)
        );
        if let Some(parent) = parent_id {
            query.push_str(&format!(" and {} in parents", quote(parent)));
        }

        let page = self.list_page(&query, 1, None, None).await?;
        Ok(page.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let mut body = json!({ "name": name, "mimeType": FOLDER_MIME_TYPE });
        if let Some(parent) = parent_id {
            body["parents"] = json!([parent]);
        }

        let request = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(self.token().await?)
            .query(&[("fields", "id")])
            .json(&body);
        let created: CreatedFile = self
            .bounded("create folder", async {
                let resp = ensure_success(request.send().await?, "create folder").await?;
                Ok::<_, BackupError>(resp.json().await?)
            })
            .await?;
        Ok(created.id)
    }

    async fn list_children(&self, folder_id: &str, query: &ChildQuery) -> Result<Vec<RemoteEntry>> {
        let mut q = format!("{} in parents and trashed=false", quote(folder_id));
        if query.folders_only {
            q.push_str(&format!(" and mimeType='{FOLDER_MIME_TYPE}'"));
        }
        let order_by = query.newest_first.then_some("createdTime desc");

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        while entries.len() < query.limit {
            let remaining = query.limit - entries.len();
            let page = self
                .list_page(&q, remaining, order_by, page_token.as_deref())
                .await?;
            entries.extend(page.files.into_iter().map(RemoteEntry::from));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        entries.truncate(query.limit);
        Ok(entries)
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        parent_id: &str,
        properties: &Properties,
    ) -> Result<String> {
        let mut file = File::open(local_path).await?;
        let total = file.metadata().await?.len();

        let session_uri = self
            .start_resumable_upload(remote_name, parent_id, properties, total)
            .await?;
        debug!(name = remote_name, bytes = total, "Started resumable upload");

        let mut offset = 0u64;
        loop {
            let want = (total - offset).min(self.chunk_size as u64) as usize;
            let mut chunk = vec![0u8; want];
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.read_exact(&mut chunk).await?;

            match self.put_chunk(&session_uri, chunk, offset, total).await? {
                ChunkOutcome::Complete(id) => return Ok(id),
                ChunkOutcome::Incomplete(persisted) => {
                    if persisted <= offset && want > 0 {
                        return Err(BackupError::remote(format!(
                            "upload of {remote_name} made no progress at byte {offset}"
                        )));
                    }
                    if persisted >= total {
                        return Err(BackupError::remote(format!(
                            "upload of {remote_name} stored all bytes but was not finalized"
                        )));
                    }
                    offset = persisted;
                    debug!(name = remote_name, offset, total, "Upload chunk accepted");
                }
            }
        }
    }

    async fn download(&self, remote_id: &str, local_path: &Path) -> Result<u64> {
        let request = self
            .client
            .get(format!("{}/files/{}", self.api_base, urlencoding::encode(remote_id)))
            .bearer_auth(self.token().await?)
            .query(&[("alt", "media")]);
        let resp = self
            .bounded("download", async {
                ensure_success(request.send().await?, "download").await
            })
            .await?;

        let mut out = File::create(local_path).await?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        // The limit applies to each wait for body bytes, not the whole body.
        while let Some(chunk) = self
            .bounded("download body", async {
                Ok::<_, BackupError>(stream.next().await)
            })
            .await?
        {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        Ok(written)
    }

    async fn delete_file(&self, remote_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(format!("{}/files/{}", self.api_base, urlencoding::encode(remote_id)))
            .bearer_auth(self.token().await?);
        self.bounded("delete", async {
            ensure_success(request.send().await?, "delete").await?;
            Ok::<_, BackupError>(())
        })
        .await
    }

    async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.delete_file(folder_id).await
    }
}
