//! Google Drive v3 object store
//!
//! Service-account authentication only: an RS256-signed JWT assertion is
//! exchanged for an access token, which is cached until shortly before it
//! expires. Creates use a `multipart/related` upload (metadata + content in
//! one request); updates replace content with an `uploadType=media` PATCH.

use super::{Container, ObjectStore, RemoteObject, SinkError};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const API_BASE_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const USER_AGENT: &str = concat!("tunekeep/", env!("CARGO_PKG_VERSION"));
const MULTIPART_BOUNDARY: &str = "tunekeep_upload_boundary_7f3a9c";

/// Assertion lifetime; the provider's maximum
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh the access token this long before it expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Fields of a service-account key file that signing needs.
/// Not `Debug`: it holds the private key.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(text: &str) -> Result<Self, SinkError> {
        let key: Self = serde_json::from_str(text)
            .map_err(|e| SinkError::Auth(format!("Invalid service account JSON: {}", e)))?;
        if key.kind != "service_account" {
            return Err(SinkError::Auth(format!(
                "Credential type is '{}', expected 'service_account'",
                key.kind
            )));
        }
        Ok(key)
    }

    /// Inline JSON wins; the key file is the fallback
    pub fn from_sources(json: Option<&str>, file: Option<&Path>) -> Result<Self, SinkError> {
        let mut last_error = None;

        if let Some(text) = json.filter(|t| !t.trim().is_empty()) {
            match Self::from_json(text) {
                Ok(key) => return Ok(key),
                Err(e) => {
                    warn!("Ignoring inline service account: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                SinkError::Auth(format!(
                    "Cannot read service account file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            return Self::from_json(&text);
        }

        Err(last_error.unwrap_or_else(|| {
            SinkError::Auth(
                "No service account configured (GDRIVE_SA_JSON or GDRIVE_SA_FILE)".into(),
            )
        }))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteObject>,
}

#[derive(Debug, Deserialize)]
struct FileId {
    id: String,
}

pub struct DriveStore {
    http_client: reqwest::Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl DriveStore {
    pub fn new(key: ServiceAccountKey) -> Result<Self, SinkError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SinkError::Auth(format!("Invalid private key: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            key,
            encoding_key,
            token: Mutex::new(None),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Fetch the container's metadata; returns its display name
    pub async fn verify_container(&self, container: &Container) -> Result<String, SinkError> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", API_BASE_URL, container.folder_id());

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("fields", "id, name")])
            .query(&all_drives_params(container))
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let object: RemoteObject = parse_json(check_status(response).await?).await?;
        info!(folder = %object.name, id = %object.id, "Upload target verified");
        Ok(object.name)
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let assertion = self.sign_assertion()?;
        debug!(account = %self.key.client_email, "Requesting access token");

        let response = self
            .http_client
            .post(&self.key.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let response = check_status(response).await.map_err(|e| match e {
            SinkError::Http { status, body } => {
                SinkError::Auth(format!("Token exchange rejected ({}): {}", status, body))
            }
            other => other,
        })?;
        let token: TokenResponse = parse_json(response).await?;

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(access_token)
    }

    fn sign_assertion(&self) -> Result<String, SinkError> {
        let iat = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| SinkError::Auth(format!("Failed to sign assertion: {}", e)))
    }
}

#[async_trait]
impl ObjectStore for DriveStore {
    async fn list(
        &self,
        name: &str,
        container: &Container,
    ) -> Result<Vec<RemoteObject>, SinkError> {
        let token = self.access_token().await?;
        let query = name_query(name, container.folder_id());

        let response = self
            .http_client
            .get(API_BASE_URL)
            .bearer_auth(&token)
            .query(&[("q", query.as_str()), ("pageSize", "1"), ("fields", "files(id, name)")])
            .query(&all_drives_params(container))
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let list: FileList = parse_json(check_status(response).await?).await?;
        Ok(list.files)
    }

    async fn create(
        &self,
        content: &Path,
        name: &str,
        container: &Container,
    ) -> Result<String, SinkError> {
        let token = self.access_token().await?;
        let data = tokio::fs::read(content).await?;
        let metadata = serde_json::json!({
            "name": name,
            "parents": [container.folder_id()],
        });
        let body = multipart_body(&metadata.to_string(), mime_type(content), &data);

        let response = self
            .http_client
            .post(UPLOAD_BASE_URL)
            .bearer_auth(&token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .query(&all_drives_params(container))
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let created: FileId = parse_json(check_status(response).await?).await?;
        Ok(created.id)
    }

    async fn update(
        &self,
        id: &str,
        content: &Path,
        container: &Container,
    ) -> Result<String, SinkError> {
        let token = self.access_token().await?;
        let data = tokio::fs::read(content).await?;
        let url = format!("{}/{}", UPLOAD_BASE_URL, id);

        let response = self
            .http_client
            .patch(&url)
            .bearer_auth(&token)
            .query(&[("uploadType", "media"), ("fields", "id")])
            .query(&all_drives_params(container))
            .header(reqwest::header::CONTENT_TYPE, mime_type(content))
            .body(data)
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let updated: FileId = parse_json(check_status(response).await?).await?;
        Ok(updated.id)
    }
}

/// Search expression for a non-trashed object by exact name in a folder
pub fn name_query(name: &str, folder_id: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and trashed = false",
        escape_query_value(name),
        escape_query_value(folder_id)
    )
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn all_drives_params(container: &Container) -> Vec<(&'static str, &'static str)> {
    if container.is_shared() {
        vec![("supportsAllDrives", "true"), ("includeItemsFromAllDrives", "true")]
    } else {
        Vec::new()
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// `multipart/related` body: JSON metadata part, then the content part
pub fn multipart_body(metadata_json: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);
    body.extend_from_slice(
        format!(
            concat!(
                "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
                "{m}\r\n--{b}\r\nContent-Type: {c}\r\n\r\n",
            ),
            b = MULTIPART_BOUNDARY,
            m = metadata_json,
            c = content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Http {
        status: status.as_u16(),
        body,
    })
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SinkError> {
    response
        .json::<T>()
        .await
        .map_err(|e| SinkError::Parse(e.to_string()))
}
