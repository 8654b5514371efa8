use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio::fs::File;
use tracing::{debug, info};

use super::http::{content_range, ensure_success, percent_encode, read_chunk, stream_to_file};
use super::token::{BearerAuth, RefreshGrant};
use super::{base_name, join_key, BackendSettings, RemoteFile, StorageBackend};

const GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_FOLDER: &str = "sitevault";
const DEFAULT_SCOPE: &str = "Files.ReadWrite offline_access";
/// Larger files need an upload session.
const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;
/// A multiple of 320 KiB, as upload sessions require.
const SESSION_CHUNK: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct UploadSession {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "lastModifiedDateTime")]
    last_modified: Option<DateTime<Utc>>,
    file: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Children {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// OneDrive through Microsoft Graph. Locators are drive paths
/// relative to the root, `folder/key`.
pub struct OneDriveStorage {
    client: Client,
    auth: BearerAuth,
    graph_url: String,
    folder: String,
    simple_limit: u64,
    chunk_size: u64,
}

impl OneDriveStorage {
    pub fn from_settings(settings: &BackendSettings, client: Client) -> Result<Self> {
        let tenant = settings.get_str("tenant").unwrap_or("common");
        let grant = match settings.get_str("refresh_token") {
            Some(refresh) => Some(RefreshGrant {
                token_url: settings
                    .get_str("token_url")
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!("https://login.microsoftonline.com/{}/oauth2/v2.0/token", tenant)
                    }),
                client_id: settings.require_str("client_id")?.to_string(),
                client_secret: settings.require_str("client_secret")?.to_string(),
                refresh_token: refresh.to_string(),
                scope: Some(settings.get_str("scope").unwrap_or(DEFAULT_SCOPE).to_string()),
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
            graph_url: settings
                .get_str("graph_url")
                .unwrap_or(GRAPH_URL)
                .trim_end_matches('/')
                .to_string(),
            folder: settings.get_dir("folder").unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            simple_limit: settings.get_u64("chunk_threshold").unwrap_or(SIMPLE_UPLOAD_LIMIT),
            chunk_size: settings.get_u64("chunk_size").unwrap_or(SESSION_CHUNK).max(1),
        })
    }

    fn item_url(&self, locator: &str, suffix: &str) -> String {
        let path = join_key(Some(&self.folder), locator);
        format!(
            "{}/me/drive/root:/{}{}",
            self.graph_url,
            percent_encode(&path, true),
            suffix
        )
    }

    async fn checked(&self, response: Response) -> Response {
        if response.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        response
    }

    async fn upload_in_chunks(&self, local_path: &Path, key: &str, size: u64) -> Result<()> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(self.item_url(key, ":/createUploadSession"))
            .bearer_auth(&token)
            .json(&json!({ "item": { "@microsoft.graph.conflictBehavior": "replace" } }))
            .send()
            .await?;
        let response = self.checked(response).await;
        let session: UploadSession = ensure_success(response, "OneDrive upload session")
            .await?
            .json()
            .await?;

        let mut file = File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;
        let mut offset = 0u64;
        while offset < size {
            let chunk = read_chunk(&mut file, self.chunk_size as usize).await?;
            if chunk.is_empty() {
                anyhow::bail!("{} shrank during upload", local_path.display());
            }
            let len = chunk.len() as u64;
            // The upload URL is pre-authorized; no bearer token.
            let response = self
                .client
                .put(&session.upload_url)
                .header("Content-Length", len)
                .header("Content-Range", content_range(offset, len, size))
                .body(chunk)
                .send()
                .await?;
            let status = response.status();
            match status {
                StatusCode::ACCEPTED => {
                    offset += len;
                    debug!("OneDrive accepted {}/{} bytes of {}", offset, size, key);
                }
                StatusCode::OK | StatusCode::CREATED => return Ok(()),
                _ => {
                    ensure_success(response, "OneDrive chunk upload").await?;
                    anyhow::bail!("OneDrive chunk upload returned unexpected HTTP {}", status);
                }
            }
        }
        anyhow::bail!("OneDrive upload session for {} never completed", key)
    }
}

#[async_trait]
impl StorageBackend for OneDriveStorage {
    fn kind(&self) -> &'static str {
        "onedrive"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let locator = join_key(Some(&self.folder), remote_key);
        let size = tokio::fs::metadata(local_path).await?.len();
        info!("Uploading {} to OneDrive {}", local_path.display(), locator);

        if size > self.simple_limit {
            self.upload_in_chunks(local_path, &locator, size).await?;
        } else {
            let data = tokio::fs::read(local_path).await?;
            let token = self.auth.token().await?;
            let response = self
                .client
                .put(self.item_url(&locator, ":/content"))
                .bearer_auth(token)
                .header("Content-Type", "application/octet-stream")
                .body(data)
                .send()
                .await?;
            let response = self.checked(response).await;
            ensure_success(response, "OneDrive upload").await?;
        }
        Ok(locator)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.item_url(locator, ":/content"))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = ensure_success(self.checked(response).await, "OneDrive download").await?;
        stream_to_file(response, local_path).await?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .delete(self.item_url(locator, ""))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(self.checked(response).await, "OneDrive delete").await?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(self.item_url(locator, ""))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(self.checked(response).await, "OneDrive metadata").await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let token = self.auth.token().await?;
        let mut next = Some(format!(
            "{}/me/drive/root:/{}:/children",
            self.graph_url,
            percent_encode(&self.folder, true)
        ));
        let mut files = Vec::new();
        while let Some(url) = next.take() {
            let response = self.client.get(&url).bearer_auth(&token).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                break;
            }
            let page: Children = ensure_success(response, "OneDrive list").await?.json().await?;
            for item in page.value {
                if item.file.is_none() || !item.name.starts_with(prefix) {
                    continue;
                }
                files.push(RemoteFile {
                    path: join_key(Some(&self.folder), &base_name(&item.name)),
                    name: item.name,
                    size: item.size,
                    modified_at: item.last_modified,
                });
            }
            next = page.next_link;
        }
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .get(format!("{}/me/drive", self.graph_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_session_upload_sends_ranges() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/drive/root:/site/big.tar.gz:/createUploadSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": format!("{}/upload/session-1", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/session-1"))
            .and(header("Content-Range", "bytes 0-9/25"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/session-1"))
            .and(header("Content-Range", "bytes 10-19/25"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/session-1"))
            .and(header("Content-Range", "bytes 20-24/25"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "item-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = BackendSettings::new()
            .with("access_token", "tok")
            .with("graph_url", server.uri())
            .with("folder", "site")
            .with("chunk_threshold", 10)
            .with("chunk_size", 10);
        let storage = OneDriveStorage::from_settings(&settings, Client::new())?;

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("big.tar.gz");
        std::fs::write(&file, vec![1u8; 25])?;
        assert_eq!(storage.upload(&file, "big.tar.gz").await?, "site/big.tar.gz");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_item_reports_false() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/drive/root:/sitevault/old.tar.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let settings = BackendSettings::new()
            .with("access_token", "tok")
            .with("graph_url", server.uri());
        let storage = OneDriveStorage::from_settings(&settings, Client::new())?;
        assert!(!storage.exists("sitevault/old.tar.gz").await?);
        assert!(!storage.exists("old.tar.gz").await?);
        Ok(())
    }

    #[test]
    fn test_refresh_needs_client_credentials() {
        let settings = BackendSettings::new().with("refresh_token", "r");
        assert!(OneDriveStorage::from_settings(&settings, Client::new()).is_err());
    }
}
