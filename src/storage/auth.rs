/// OAuth2 credentials for the Google Drive backend.
///
/// The backup core only ever sees a [`DriveSession`]. This module is the
/// collaborator that produces one:
/// - loads the installed-app client secrets and the stored user token
/// - refreshes an expired access token and persists the refreshed token
/// - runs the one-time PKCE consent flow with a loopback redirect
///
/// The host process builds the session once and hands it to every
/// component by reference.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{BackupError, Phase, Result};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

/// Layout of the client file downloaded from the Google Cloud console.
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

/// OAuth client registration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BackupError::auth(format!(
                "OAuth client file {} unreadable ({e}); download it from Google Cloud Console: \
                 APIs & Services > Credentials > OAuth 2.0 Client IDs",
                path.display()
            ))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(raw)
            .map_err(|e| BackupError::auth(format!("invalid OAuth client file: {e}")))?;
        file.installed.or(file.web).ok_or_else(|| {
            BackupError::auth(
                "OAuth client file has neither an 'installed' nor a 'web' section",
            )
        })
    }
}

/// User token persisted between process runs.
///
/// Also reads the `token` / `expiry` field names written by Google's own
/// client libraries, so an existing token file can be reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now,
            None => false,
        }
    }

    /// `Ok(None)` when no token has been stored yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                BackupError::auth(format!(
                    "token file {} is unreadable: {e}",
                    path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io(Phase::Authenticate, e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BackupError::io(Phase::Authenticate, e))?;
        }
        std::fs::write(path, json).map_err(|e| BackupError::io(Phase::Authenticate, e))
    }
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }
}

/// Everything needed to trade a refresh token for a new access token.
#[derive(Debug, Clone)]
struct TokenEndpoint {
    client: Client,
    secrets: ClientSecrets,
    /// Refreshed tokens are written back here when set.
    token_file: Option<PathBuf>,
}

impl TokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<StoredToken> {
        let mut form = vec![
            ("client_id", self.secrets.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &self.secrets.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .client
            .post(&self.secrets.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| BackupError::auth(format!("token refresh request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::auth(format!(
                "token refresh rejected ({status}): {body}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackupError::auth(format!("invalid token response: {e}")))?;
        let token = body.into_token(Some(refresh_token.to_string()));

        if let Some(path) = &self.token_file {
            if let Err(e) = token.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to persist refreshed token");
            }
        }

        Ok(token)
    }
}

/// Authenticated handle to Google Drive.
///
/// Safe to share between concurrent operations: token refresh happens
/// under an async mutex.
pub struct DriveSession {
    token: Mutex<StoredToken>,
    endpoint: Option<TokenEndpoint>,
}

impl DriveSession {
    /// Session around a fixed bearer token that is never refreshed.
    pub fn from_access_token(access_token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(StoredToken {
                access_token: access_token.into(),
                refresh_token: None,
                expires_at: None,
            }),
            endpoint: None,
        }
    }

    fn with_refresh(token: StoredToken, endpoint: TokenEndpoint) -> Self {
        Self {
            token: Mutex::new(token),
            endpoint: Some(endpoint),
        }
    }

    /// A currently valid access token, refreshed first if needed.
    pub async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if token.is_expired(Utc::now()) {
            let endpoint = self.endpoint.as_ref().ok_or_else(|| {
                BackupError::auth(
                    "access token expired and no OAuth client is configured to refresh it",
                )
            })?;
            let refresh_token = token.refresh_token.clone().ok_or_else(|| {
                BackupError::auth(
                    "access token expired and no refresh token is stored; run `imgvault auth`",
                )
            })?;
            *token = endpoint.refresh(&refresh_token).await?;
            info!("Refreshed Google Drive access token");
        }
        Ok(token.access_token.clone())
    }
}

/// Builds [`DriveSession`]s from the client and token files.
pub struct Authenticator {
    client: Client,
    client_file: PathBuf,
    token_file: PathBuf,
    scopes: Vec<String>,
}

impl Authenticator {
    pub fn new(client_file: impl Into<PathBuf>, token_file: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            client_file: client_file.into(),
            token_file: token_file.into(),
            scopes: vec![DRIVE_SCOPE.to_string()],
        }
    }

    /// Reuse the stored token, refreshing it if it has expired.
    ///
    /// Fails with [`BackupError::Authentication`] when no usable credential
    /// material exists. Never starts the interactive consent flow.
    pub async fn authenticate(&self) -> Result<DriveSession> {
        let token = StoredToken::load(&self.token_file)?.ok_or_else(|| {
            BackupError::auth(format!(
                "no stored token at {}; run `imgvault auth` first",
                self.token_file.display()
            ))
        })?;

        let session = match ClientSecrets::load(&self.client_file) {
            Ok(secrets) => DriveSession::with_refresh(
                token,
                TokenEndpoint {
                    client: self.client.clone(),
                    secrets,
                    token_file: Some(self.token_file.clone()),
                },
            ),
            Err(e) if token.is_expired(Utc::now()) => return Err(e),
            Err(e) => {
                warn!(error = %e, "OAuth client unavailable, token will not be refreshed");
                DriveSession {
                    token: Mutex::new(token),
                    endpoint: None,
                }
            }
        };

        // Surface refresh failures here rather than on the first remote call.
        session.access_token().await?;
        Ok(session)
    }

    /// Run the consent flow: `present` receives the URL the user must open,
    /// the redirect is captured on a loopback listener, and the resulting
    /// token is stored.
    pub async fn authorize_interactive<F>(&self, present: F) -> Result<DriveSession>
    where
        F: FnOnce(&str),
    {
        let secrets = ClientSecrets::load(&self.client_file)?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| BackupError::io(Phase::Authenticate, e))?;
        let port = listener
            .local_addr()
            .map_err(|e| BackupError::io(Phase::Authenticate, e))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}");

        let (url, verifier) = authorization_url(&secrets, &redirect_uri, &self.scopes);
        present(&url);

        let code = capture_authorization_code(&listener).await?;
        let token = exchange_code(&self.client, &secrets, &code, &verifier, &redirect_uri).await?;
        token.save(&self.token_file)?;
        info!(path = %self.token_file.display(), "Stored Google Drive token");

        Ok(DriveSession::with_refresh(
            token,
            TokenEndpoint {
                client: self.client.clone(),
                secrets,
                token_file: Some(self.token_file.clone()),
            },
        ))
    }
}

/// Generate a PKCE code verifier and challenge (S256).
fn generate_pkce() -> (String, String) {
    use rand::RngCore;
    use sha2::{Digest, Sha256};

    let mut verifier_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut verifier_bytes);

    let verifier = base64_url_encode(&verifier_bytes);
    let challenge = {
        let hash = Sha256::digest(verifier.as_bytes());
        base64_url_encode(&hash)
    };

    (verifier, challenge)
}

/// Base64 URL-safe encoding without padding.
fn base64_url_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}

/// Returns (auth_url, pkce_verifier).
pub fn authorization_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    scopes: &[String],
) -> (String, String) {
    let (verifier, challenge) = generate_pkce();
    let scopes = scopes.join(" ");

    let url = format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&\
         code_challenge={}&code_challenge_method=S256&access_type=offline&prompt=consent",
        secrets.auth_uri,
        urlencoding::encode(&secrets.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(&challenge),
    );

    (url, verifier)
}

async fn exchange_code(
    client: &Client,
    secrets: &ClientSecrets,
    code: &str,
    pkce_verifier: &str,
    redirect_uri: &str,
) -> Result<StoredToken> {
    let mut form = vec![
        ("client_id", secrets.client_id.as_str()),
        ("code", code),
        ("code_verifier", pkce_verifier),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri),
    ];
    if let Some(secret) = &secrets.client_secret {
        form.push(("client_secret", secret.as_str()));
    }

    let resp = client
        .post(&secrets.token_uri)
        .form(&form)
        .send()
        .await
        .map_err(|e| BackupError::auth(format!("token exchange request failed: {e}")))?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BackupError::auth(format!(
            "Token exchange failed: {body}"
        )));
    }

    let body: TokenResponse = resp
        .json()
        .await
        .map_err(|e| BackupError::auth(format!("invalid token response: {e}")))?;
    Ok(body.into_token(None))
}

/// Accept redirects on the loopback listener until one carries a code or
/// an error. Other requests (favicon and the like) are answered and ignored.
async fn capture_authorization_code(listener: &TcpListener) -> Result<String> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| BackupError::io(Phase::Authenticate, e))?;

        let mut request_line = String::new();
        {
            let mut reader = BufReader::new(&mut stream);
            reader
                .read_line(&mut request_line)
                .await
                .map_err(|e| BackupError::io(Phase::Authenticate, e))?;
        }

        let outcome = parse_redirect(&request_line);
        let message = match &outcome {
            Some(Ok(_)) => "Authorization complete. You can close this window.",
            Some(Err(_)) => "Authorization was not granted. You can close this window.",
            None => "Waiting for authorization.",
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{message}",
            message.len()
        );
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            warn!(error = %e, "Failed to answer OAuth redirect");
        }

        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}

/// Extract `code` (or a consent `error`) from an HTTP request line such as
/// `GET /?code=abc&scope=... HTTP/1.1`.
fn parse_redirect(request_line: &str) -> Option<Result<String>> {
    let target = request_line.split_whitespace().nth(1)?;
    let (_, query) = target.split_once('?')?;

    let mut code = None;
    let mut error = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "code" => code = Some(value),
            "error" => error = Some(value),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(Err(BackupError::auth(format!(
            "consent was not granted: {error}"
        ))));
    }
    code.map(Ok)
}
