//! Google Drive provider
//!
//! OAuth2 authorization-code flow with offline access. The access token
//! is refreshed when it expires within five minutes and the refreshed
//! token is persisted for reuse. Archives are sent as a single
//! `multipart/related` upload; listing, download and delete go through
//! the Files API and only see gzip files in the configured folder.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::token::{OAuthTokens, TokenStore};
use super::{
    http_client, write_body, CloudError, CloudProvider, CloudResult, RemoteBackup, RemoteObject,
};
use crate::config::GoogleDriveConfig;
use crate::observability::{log_event, Event};

pub const PROVIDER_NAME: &str = "google_drive";

const SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const BOUNDARY: &str = "nexus_backup_upload_boundary";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    /// Drive reports sizes as decimal strings
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
}

impl From<DriveFile> for RemoteBackup {
    fn from(file: DriveFile) -> Self {
        RemoteBackup {
            path: remote_path(&file.id),
            size: file.size.and_then(|s| s.parse().ok()),
            created_at: file.created_time,
            name: file.name,
            id: file.id,
        }
    }
}

fn remote_path(file_id: &str) -> String {
    format!("gdrive://{}", file_id)
}

/// Connection state reported to operators
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DriveStatus {
    pub configured: bool,
    pub connected: bool,
    pub has_valid_tokens: bool,
    pub folder_id: Option<String>,
}

impl DriveStatus {
    /// Status when no OAuth client is configured
    pub fn unconfigured(folder_id: Option<String>) -> Self {
        Self {
            configured: false,
            connected: false,
            has_valid_tokens: false,
            folder_id,
        }
    }
}

pub struct GoogleDriveProvider {
    config: GoogleDriveConfig,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    tokens: TokenStore,
    client: reqwest::Client,
}

impl GoogleDriveProvider {
    pub fn new(config: GoogleDriveConfig, tokens: TokenStore) -> CloudResult<Self> {
        let (Some(client_id), Some(client_secret), Some(redirect_uri)) = (
            config.client_id.clone(),
            config.client_secret.clone(),
            config.redirect_uri.clone(),
        ) else {
            return Err(CloudError::NotConfigured(
                "GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REDIRECT_URI are required"
                    .to_string(),
            ));
        };

        Ok(Self {
            config,
            client_id,
            client_secret,
            redirect_uri,
            tokens,
            client: http_client()?,
        })
    }

    /// URL the operator visits to grant access
    pub fn authorization_url(&self, state: Option<&str>) -> String {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        if let Some(state) = state {
            params.push(("state", state));
        }
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("{}?{}", self.config.auth_url, query.join("&"))
    }

    /// Trade an authorization code for tokens and persist them
    pub async fn exchange_code(&self, code: &str) -> CloudResult<OAuthTokens> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;
        let tokens = self.read_token_response(response, None).await?;
        self.tokens.save(&tokens)?;
        Ok(tokens)
    }

    /// A usable access token, refreshing it first if it is about to expire
    pub async fn access_token(&self) -> CloudResult<String> {
        let tokens = self.tokens.load().ok_or_else(|| {
            CloudError::Auth("Google Drive is not connected; authorization required".to_string())
        })?;
        if !tokens.needs_refresh(Utc::now()) {
            return Ok(tokens.access_token);
        }
        Ok(self.refresh(&tokens).await?.access_token)
    }

    async fn refresh(&self, current: &OAuthTokens) -> CloudResult<OAuthTokens> {
        let refresh_token = current.refresh_token.as_deref().ok_or_else(|| {
            CloudError::Auth("access token expired and no refresh token is stored".to_string())
        })?;

        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        let refreshed = self
            .read_token_response(response, Some(refresh_token))
            .await?;
        self.tokens.save(&refreshed)?;
        log_event(
            Event::TokenRefreshed,
            &[
                ("provider", PROVIDER_NAME),
                ("expires_at", &refreshed.expires_at.to_rfc3339()),
            ],
        );
        Ok(refreshed)
    }

    async fn read_token_response(
        &self,
        response: reqwest::Response,
        previous_refresh: Option<&str>,
    ) -> CloudResult<OAuthTokens> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("token endpoint returned {}: {}", status, body);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    CloudError::Auth(message)
                }
                _ => CloudError::Upload(message),
            });
        }

        let data: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Auth(format!("malformed token response: {}", e)))?;
        Ok(OAuthTokens {
            access_token: data.access_token,
            refresh_token: data
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: Utc::now() + Duration::seconds(data.expires_in),
            token_type: data.token_type,
            scope: data.scope,
        })
    }

    pub fn status(&self) -> DriveStatus {
        let tokens = self.tokens.load();
        DriveStatus {
            configured: true,
            connected: tokens.is_some(),
            has_valid_tokens: tokens.map_or(false, |t| t.is_valid(Utc::now())),
            folder_id: self.config.folder_id.clone(),
        }
    }

    /// Forget stored tokens
    pub fn disconnect(&self) -> bool {
        self.tokens.clear()
    }

    /// Files API query selecting backup archives
    fn list_query(&self) -> String {
        let mut query = "(mimeType='application/gzip' or mimeType='application/x-gzip') and trashed=false"
            .to_string();
        if let Some(folder) = &self.config.folder_id {
            query.push_str(&format!(" and '{}' in parents", folder.replace('\'', "\\'")));
        }
        query
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.config.api_url, urlencoding::encode(file_id))
    }

    fn metadata(&self, remote_name: &str) -> serde_json::Value {
        let mut metadata = serde_json::json!({
            "name": remote_name,
            "mimeType": "application/gzip",
        });
        if let Some(folder) = &self.config.folder_id {
            metadata["parents"] = serde_json::json!([folder]);
        }
        metadata
    }
}

/// `multipart/related` body: JSON metadata part, then the file bytes
pub(crate) fn multipart_body(metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/gzip\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--", BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl CloudProvider for GoogleDriveProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn upload(&self, path: &Path, remote_name: &str) -> CloudResult<RemoteObject> {
        let access_token = self.access_token().await?;
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| CloudError::Upload(format!("cannot read {}: {}", path.display(), e)))?;
        let body = multipart_body(&self.metadata(remote_name), &content);

        let response = self
            .client
            .post(format!(
                "{}/files?uploadType=multipart&fields=id,name",
                self.config.upload_url
            ))
            .bearer_auth(&access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("Drive returned {}: {}", status, text);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
                _ => CloudError::Upload(message),
            });
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Upload(format!("malformed upload response: {}", e)))?;
        Ok(RemoteObject {
            provider: PROVIDER_NAME.to_string(),
            path: remote_path(&uploaded.id),
            id: uploaded.id,
        })
    }

    async fn list(&self) -> CloudResult<Vec<RemoteBackup>> {
        let access_token = self.access_token().await?;
        let query = self.list_query();

        let mut backups = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.as_str()),
                (
                    "fields",
                    "nextPageToken,files(id,name,size,createdTime,modifiedTime,mimeType)",
                ),
                ("orderBy", "createdTime desc"),
                ("pageSize", "100"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let response = self
                .client
                .get(format!("{}/files", self.config.api_url))
                .bearer_auth(&access_token)
                .query(&params)
                .send()
                .await
                .map_err(CloudError::request)?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CloudError::from_status(
                    status,
                    format!("Drive returned {}: {}", status, text),
                    CloudError::Request,
                ));
            }
            let page: FileList = response
                .json()
                .await
                .map_err(|e| CloudError::Request(format!("malformed file list: {}", e)))?;
            backups.extend(page.files.into_iter().map(RemoteBackup::from));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(backups)
    }

    async fn download(&self, remote_id: &str, dest: &Path) -> CloudResult<u64> {
        let access_token = self.access_token().await?;
        let response = self
            .client
            .get(self.file_url(remote_id))
            .bearer_auth(&access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(CloudError::request)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(
                status,
                format!("Drive file {} returned {}: {}", remote_id, status, text),
                CloudError::Request,
            ));
        }
        write_body(response, dest).await
    }

    async fn delete(&self, remote_id: &str) -> CloudResult<()> {
        let access_token = self.access_token().await?;
        let response = self
            .client
            .delete(self.file_url(remote_id))
            .bearer_auth(&access_token)
            .send()
            .await
            .map_err(CloudError::request)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(
                status,
                format!("Drive file {} returned {}: {}", remote_id, status, text),
                CloudError::Request,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as AxumPath, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config(token_url: &str) -> GoogleDriveConfig {
        GoogleDriveConfig {
            client_id: Some("client-1".into()),
            client_secret: Some("secret".into()),
            redirect_uri: Some("http://localhost:3000/callback".into()),
            folder_id: Some("folder-9".into()),
            token_url: token_url.to_string(),
            ..GoogleDriveConfig::default()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_requires_configuration() {
        let temp = TempDir::new().unwrap();
        let result = GoogleDriveProvider::new(
            GoogleDriveConfig::default(),
            TokenStore::new(temp.path().join("t.json")),
        );
        assert!(matches!(result, Err(CloudError::NotConfigured(_))));
    }

    #[test]
    fn test_authorization_url() {
        let temp = TempDir::new().unwrap();
        let provider = GoogleDriveProvider::new(
            config("http://unused"),
            TokenStore::new(temp.path().join("t.json")),
        )
        .unwrap();

        let url = provider.authorization_url(Some("abc"));
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("state=abc"));
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body(&serde_json::json!({"name": "b.tar.gz"}), b"GZ");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--nexus_backup_upload_boundary\r\n"));
        assert!(text.contains("{\"name\":\"b.tar.gz\"}"));
        assert!(text.contains("Content-Type: application/gzip\r\n\r\nGZ"));
        assert!(text.ends_with("--nexus_backup_upload_boundary--"));
    }

    #[tokio::test]
    async fn test_not_connected_is_auth_error() {
        let temp = TempDir::new().unwrap();
        let provider = GoogleDriveProvider::new(
            config("http://unused"),
            TokenStore::new(temp.path().join("t.json")),
        )
        .unwrap();
        assert!(matches!(
            provider.access_token().await,
            Err(CloudError::Auth(_))
        ));
        assert!(!provider.status().connected);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_auth_error() {
        let temp = TempDir::new().unwrap();
        let store = TokenStore::new(temp.path().join("t.json"));
        store
            .save(&OAuthTokens {
                access_token: "old".into(),
                refresh_token: None,
                expires_at: Utc::now() - Duration::hours(1),
                token_type: None,
                scope: None,
            })
            .unwrap();

        let provider = GoogleDriveProvider::new(config("http://unused"), store).unwrap();
        assert!(matches!(
            provider.access_token().await,
            Err(CloudError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rejected_is_auth_error() {
        let url = serve(Router::new().route(
            "/token",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(serde_json::json!({"error": "invalid_grant"})),
                )
            }),
        ))
        .await;

        let temp = TempDir::new().unwrap();
        let store = TokenStore::new(temp.path().join("t.json"));
        store
            .save(&OAuthTokens {
                access_token: "old".into(),
                refresh_token: Some("revoked".into()),
                expires_at: Utc::now() - Duration::hours(1),
                token_type: None,
                scope: None,
            })
            .unwrap();

        let provider =
            GoogleDriveProvider::new(config(&format!("{}/token", url)), store).unwrap();
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_refresh_persists_new_token() {
        let url = serve(Router::new().route(
            "/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "fresh",
                    "expires_in": 3600,
                    "token_type": "Bearer"
                }))
            }),
        ))
        .await;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.json");
        let store = TokenStore::new(&path);
        store
            .save(&OAuthTokens {
                access_token: "old".into(),
                refresh_token: Some("keep-me".into()),
                expires_at: Utc::now() + Duration::minutes(2),
                token_type: None,
                scope: None,
            })
            .unwrap();

        let provider =
            GoogleDriveProvider::new(config(&format!("{}/token", url)), store).unwrap();
        assert_eq!(provider.access_token().await.unwrap(), "fresh");

        let persisted = TokenStore::new(&path).load().unwrap();
        assert_eq!(persisted.access_token, "fresh");
        assert_eq!(persisted.refresh_token.as_deref(), Some("keep-me"));
        assert!(!persisted.needs_refresh(Utc::now()));
        assert!(provider.status().has_valid_tokens);

        assert!(provider.disconnect());
        assert!(!provider.status().connected);
    }

    fn connected_provider(temp: &TempDir, api_url: &str) -> GoogleDriveProvider {
        let store = TokenStore::new(temp.path().join("t.json"));
        store
            .save(&OAuthTokens {
                access_token: "live".into(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
                token_type: Some("Bearer".into()),
                scope: None,
            })
            .unwrap();
        let config = GoogleDriveConfig {
            api_url: api_url.to_string(),
            ..config("http://unused")
        };
        GoogleDriveProvider::new(config, store).unwrap()
    }

    #[tokio::test]
    async fn test_list_download_delete() {
        let url = serve(
            Router::new()
                .route(
                    "/files",
                    get(|Query(params): Query<HashMap<String, String>>| async move {
                        assert!(params["q"].contains("'folder-9' in parents"));
                        assert!(params["q"].contains("trashed=false"));
                        Json(serde_json::json!({"files": [{
                            "id": "f1",
                            "name": "backup-a.tar.gz",
                            "size": "42",
                            "createdTime": "2026-03-01T10:00:00Z",
                            "mimeType": "application/gzip"
                        }]}))
                    }),
                )
                .route(
                    "/files/:id",
                    get(|AxumPath(id): AxumPath<String>| async move {
                        if id == "f1" {
                            (AxumStatus::OK, b"archive-bytes".to_vec())
                        } else {
                            (AxumStatus::NOT_FOUND, Vec::new())
                        }
                    })
                    .delete(|AxumPath(id): AxumPath<String>| async move {
                        if id == "f1" {
                            AxumStatus::NO_CONTENT
                        } else {
                            AxumStatus::NOT_FOUND
                        }
                    }),
                ),
        )
        .await;

        let temp = TempDir::new().unwrap();
        let provider = connected_provider(&temp, &url);

        let listed = provider.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "gdrive://f1");
        assert_eq!(listed[0].size, Some(42));
        assert!(listed[0].created_at.is_some());
        provider.test_connection().await.unwrap();

        let dest = temp.path().join("dl.tar.gz");
        assert_eq!(provider.download("f1", &dest).await.unwrap(), 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive-bytes");
        assert!(matches!(
            provider.download("missing", &temp.path().join("x")).await,
            Err(CloudError::NotFound(_))
        ));

        provider.delete("f1").await.unwrap();
        assert!(matches!(
            provider.delete("missing").await,
            Err(CloudError::NotFound(_))
        ));
    }
}
