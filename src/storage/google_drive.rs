use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{redirect, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::info;

use super::http::{ensure_success, location, resumable_upload, stream_to_file};
use super::token::{BearerAuth, RefreshGrant};
use super::{base_name, BackendSettings, RemoteFile, StorageBackend};

const API_URL: &str = "https://www.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SINGLE_REQUEST_LIMIT: u64 = 5 * 1024 * 1024;
/// Must be a multiple of 256 KiB.
const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    size: Option<String>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    trashed: bool,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Google Drive v3. Locators are Drive file ids.
pub struct GoogleDriveStorage {
    client: Client,
    auth: BearerAuth,
    api_url: String,
    folder_id: String,
    single_limit: u64,
    chunk_size: u64,
}

impl GoogleDriveStorage {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        // Resumable sessions answer 308 without a Location; never follow.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        let grant = match settings.get_str("refresh_token") {
            Some(refresh) => Some(RefreshGrant {
                token_url: settings.get_str("token_url").unwrap_or(TOKEN_URL).to_string(),
                client_id: settings.require_str("client_id")?.to_string(),
                client_secret: settings.require_str("client_secret")?.to_string(),
                refresh_token: refresh.to_string(),
                scope: None,
            }),
            None => None,
        };
        let auth = BearerAuth::new(
            client.clone(),
            settings.get_str("access_token").map(str::to_string),
            grant,
        )?;
        Ok(Self {
            client,
            auth,
            api_url: settings
                .get_str("api_url")
                .unwrap_or(API_URL)
                .trim_end_matches('/')
                .to_string(),
            folder_id: settings.get_str("folder_id").unwrap_or("root").to_string(),
            single_limit: settings.get_u64("chunk_threshold").unwrap_or(SINGLE_REQUEST_LIMIT),
            chunk_size: settings.get_u64("chunk_size").unwrap_or(CHUNK_SIZE),
        })
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/drive/v3/files/{}", self.api_url, id)
    }
}

#[async_trait]
impl StorageBackend for GoogleDriveStorage {
    fn kind(&self) -> &'static str {
        "google_drive"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let name = base_name(remote_key);
        info!("Uploading {} to Google Drive as {}", local_path.display(), name);

        let token = self.auth.token().await?;
        let response = self
            .client
            .post(format!("{}/upload/drive/v3/files", self.api_url))
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "application/gzip")
            .header("X-Upload-Content-Length", size)
            .json(&json!({ "name": name, "parents": [self.folder_id] }))
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        let response = ensure_success(response, "Google Drive upload session").await?;
        let session_url = location(&response)?;

        // Small files still go through the session, in one request.
        let chunk = if size <= self.single_limit { size } else { self.chunk_size };
        let done = resumable_upload(&self.client, &session_url, local_path, size, chunk).await?;
        let created: DriveFile = done.json().await.context("Malformed Google Drive upload response")?;
        Ok(created.id)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.file_url(locator))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = ensure_success(response, "Google Drive download").await?;
        stream_to_file(response, local_path).await?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .delete(self.file_url(locator))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, "Google Drive delete").await?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.file_url(locator))
            .query(&[("fields", "id,name,trashed")])
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let file: DriveFile = ensure_success(response, "Google Drive metadata").await?.json().await?;
        Ok(!file.trashed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let token = self.auth.token().await?;
        let query = format!(
            "'{}' in parents and mimeType != '{}' and trashed = false",
            self.folder_id.replace('\'', "\\'"),
            FOLDER_MIME
        );
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/drive/v3/files", self.api_url))
                .query(&[
                    ("q", query.as_str()),
                    ("fields", "nextPageToken,files(id,name,size,modifiedTime)"),
                    ("pageSize", "1000"),
                ])
                .bearer_auth(&token);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let page: FileList = ensure_success(request.send().await?, "Google Drive list")
                .await?
                .json()
                .await?;
            for file in page.files {
                if !file.name.starts_with(prefix) {
                    continue;
                }
                files.push(RemoteFile {
                    size: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                    modified_at: file.modified_time,
                    name: file.name,
                    path: file.id,
                });
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(format!("{}/drive/v3/about", self.api_url))
            .query(&[("fields", "user")])
            .bearer_auth(token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_resumable_upload_returns_file_id() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "resumable"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/session/abc", server.uri()).as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/abc"))
            .and(header("Content-Range", "bytes 0-7/12"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-7"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/abc"))
            .and(header("Content-Range", "bytes 8-11/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "file-9" })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = BackendSettings::new()
            .with("access_token", "tok")
            .with("api_url", server.uri())
            .with("folder_id", "folder-1")
            .with("chunk_threshold", 4)
            .with("chunk_size", 8);
        let storage = GoogleDriveStorage::from_settings(&settings)?;

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("backup_1.tar.gz");
        std::fs::write(&file, b"twelve bytes")?;
        assert_eq!(storage.upload(&file, "backup_1.tar.gz").await?, "file-9");
        Ok(())
    }

    #[tokio::test]
    async fn test_trashed_file_does_not_exist() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "f1", "name": "a.tar.gz", "trashed": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let settings = BackendSettings::new()
            .with("access_token", "tok")
            .with("api_url", server.uri());
        let storage = GoogleDriveStorage::from_settings(&settings)?;
        assert!(!storage.exists("f1").await?);
        assert!(!storage.exists("f2").await?);
        Ok(())
    }
}
