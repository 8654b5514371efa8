use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tokio::fs::File;
use tracing::{debug, info};

use super::http::{ensure_success, file_body, header_safe_json, read_chunk, stream_to_file};
use super::token::{BearerAuth, RefreshGrant};
use super::{BackendSettings, RemoteFile, StorageBackend};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const DEFAULT_FOLDER: &str = "/sitevault";
/// Files above this go through an upload session.
const SESSION_THRESHOLD: u64 = 150 * 1024 * 1024;
const SESSION_CHUNK: u64 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(rename = ".tag", default)]
    tag: String,
    name: String,
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
    client_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<FileMetadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

pub struct DropboxStorage {
    client: Client,
    auth: BearerAuth,
    api_url: String,
    content_url: String,
    folder: String,
    session_threshold: u64,
    chunk_size: u64,
}

impl DropboxStorage {
    pub fn from_settings(settings: &BackendSettings, client: Client) -> Result<Self> {
        let grant = match (
            settings.get_str("refresh_token"),
            settings.get_str("app_key"),
            settings.get_str("app_secret"),
        ) {
            (Some(refresh), Some(key), Some(secret)) => Some(RefreshGrant {
                token_url: settings.get_str("token_url").unwrap_or(TOKEN_URL).to_string(),
                client_id: key.to_string(),
                client_secret: secret.to_string(),
                refresh_token: refresh.to_string(),
                scope: None,
            }),
            _ => None,
        };
        let static_token = settings.get_str("access_token").map(str::to_string);
        let auth = BearerAuth::new(client.clone(), static_token, grant)?;

        let folder = settings
            .get_dir("folder")
            .map(|f| format!("/{}", f))
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string());

        Ok(Self {
            client,
            auth,
            api_url: trim_url(settings.get_str("api_url").unwrap_or(API_URL)),
            content_url: trim_url(settings.get_str("content_url").unwrap_or(CONTENT_URL)),
            folder,
            session_threshold: settings.get_u64("chunk_threshold").unwrap_or(SESSION_THRESHOLD),
            chunk_size: settings.get_u64("chunk_size").unwrap_or(SESSION_CHUNK).max(1),
        })
    }

    /// Absolute Dropbox path for a key; locators are already absolute.
    fn full_path(&self, key: &str) -> String {
        if key.starts_with('/') {
            return key.to_string();
        }
        if self.folder == "/" {
            format!("/{}", key)
        } else {
            format!("{}/{}", self.folder, key)
        }
    }

    async fn rpc(&self, endpoint: &str, body: &Value) -> Result<Response> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(format!("{}/{}", self.api_url, endpoint))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Dropbox request {} failed", endpoint))?;
        self.note_auth_failure(&response).await;
        Ok(response)
    }

    async fn content(&self, endpoint: &str, arg: &Value) -> Result<RequestBuilder> {
        let token = self.auth.token().await?;
        Ok(self
            .client
            .post(format!("{}/{}", self.content_url, endpoint))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", header_safe_json(arg)))
    }

    async fn note_auth_failure(&self, response: &Response) {
        if response.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
    }

    fn commit_info(path: &str) -> Value {
        json!({ "path": path, "mode": "overwrite", "autorename": false, "mute": true })
    }

    async fn upload_session(&self, local_path: &Path, path: &str, size: u64) -> Result<()> {
        let mut file = File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;
        let chunk_size = self.chunk_size as usize;

        let first = read_chunk(&mut file, chunk_size).await?;
        let mut offset = first.len() as u64;
        let response = self
            .content("files/upload_session/start", &json!({ "close": false }))
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(first)
            .send()
            .await?;
        let started: SessionStart = ensure_success(response, "Dropbox upload session start")
            .await?
            .json()
            .await?;
        debug!("Dropbox session {} started for {}", started.session_id, path);

        while offset < size {
            let chunk = read_chunk(&mut file, chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len() as u64;
            let arg = json!({
                "cursor": { "session_id": started.session_id, "offset": offset },
                "close": false
            });
            let response = self
                .content("files/upload_session/append_v2", &arg)
                .await?
                .header("Content-Type", "application/octet-stream")
                .body(chunk)
                .send()
                .await?;
            ensure_success(response, "Dropbox upload session append").await?;
            offset += len;
        }

        let arg = json!({
            "cursor": { "session_id": started.session_id, "offset": offset },
            "commit": Self::commit_info(path)
        });
        let response = self
            .content("files/upload_session/finish", &arg)
            .await?
            .header("Content-Type", "application/octet-stream")
            .send()
            .await?;
        ensure_success(response, "Dropbox upload session finish").await?;
        Ok(())
    }
}

fn trim_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[async_trait]
impl StorageBackend for DropboxStorage {
    fn kind(&self) -> &'static str {
        "dropbox"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let path = self.full_path(remote_key);
        let size = tokio::fs::metadata(local_path).await?.len();
        info!("Uploading {} to Dropbox {}", local_path.display(), path);

        if size > self.session_threshold {
            self.upload_session(local_path, &path, size).await?;
        } else {
            let (body, _) = file_body(local_path).await?;
            let response = self
                .content("files/upload", &Self::commit_info(&path))
                .await?
                .header("Content-Type", "application/octet-stream")
                .body(body)
                .send()
                .await?;
            self.note_auth_failure(&response).await;
            ensure_success(response, "Dropbox upload").await?;
        }
        Ok(path)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let path = self.full_path(locator);
        let response = self
            .content("files/download", &json!({ "path": path }))
            .await?
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        let response = ensure_success(response, "Dropbox download").await?;
        stream_to_file(response, local_path).await?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let path = self.full_path(locator);
        let response = self.rpc("files/delete_v2", &json!({ "path": path })).await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        ensure_success(response, "Dropbox delete").await?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let path = self.full_path(locator);
        let response = self.rpc("files/get_metadata", &json!({ "path": path })).await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        ensure_success(response, "Dropbox metadata").await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let folder = if self.folder == "/" { "" } else { self.folder.as_str() };
        let response = self
            .rpc("files/list_folder", &json!({ "path": folder, "recursive": false }))
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(Vec::new());
        }
        let mut page: ListFolderResult = ensure_success(response, "Dropbox list").await?.json().await?;
        let mut files = Vec::new();
        loop {
            for entry in page.entries.drain(..) {
                if entry.tag != "file" || !entry.name.starts_with(prefix) {
                    continue;
                }
                files.push(RemoteFile {
                    path: entry
                        .path_display
                        .unwrap_or_else(|| self.full_path(&entry.name)),
                    name: entry.name,
                    size: entry.size,
                    modified_at: entry.client_modified,
                });
            }
            if !page.has_more {
                break;
            }
            let response = self
                .rpc("files/list_folder/continue", &json!({ "cursor": page.cursor }))
                .await?;
            page = ensure_success(response, "Dropbox list").await?.json().await?;
        }
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(format!("{}/users/get_current_account", self.api_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
