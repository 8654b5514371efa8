use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::http::{ensure_success, file_body, percent_encode, read_chunk, stream_to_file};
use super::token::TokenCache;
use super::{join_key, BackendSettings, RemoteFile, StorageBackend};

const AUTH_URL: &str = "https://api.backblazeb2.com";
/// Account authorizations are valid for a day.
const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const LARGE_FILE_THRESHOLD: u64 = 200 * 1024 * 1024;
const PART_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct B2Session {
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct B2File {
    file_name: String,
    file_id: Option<String>,
    #[serde(default)]
    content_length: u64,
    upload_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileNames {
    files: Vec<B2File>,
    next_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartedFile {
    file_id: String,
}

/// Backblaze B2 native API. Locators are B2 file names.
pub struct BackblazeStorage {
    client: Client,
    key_id: String,
    application_key: String,
    bucket_id: String,
    bucket_name: String,
    directory: Option<String>,
    auth_url: String,
    session: TokenCache<B2Session>,
    large_threshold: u64,
    part_size: u64,
}

async fn sha1_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl BackblazeStorage {
    pub fn from_settings(settings: &BackendSettings, client: Client) -> Result<Self> {
        let key_id = settings
            .get_str("key_id")
            .or_else(|| settings.get_str("account_id"))
            .context("missing required setting 'key_id'")?;
        Ok(Self {
            client,
            key_id: key_id.to_string(),
            application_key: settings.require_str("application_key")?.to_string(),
            bucket_id: settings.require_str("bucket_id")?.to_string(),
            bucket_name: settings.require_str("bucket_name")?.to_string(),
            directory: settings.get_dir("directory"),
            auth_url: settings
                .get_str("auth_url")
                .unwrap_or(AUTH_URL)
                .trim_end_matches('/')
                .to_string(),
            session: TokenCache::new(),
            large_threshold: settings.get_u64("chunk_threshold").unwrap_or(LARGE_FILE_THRESHOLD),
            part_size: settings.get_u64("chunk_size").unwrap_or(PART_SIZE).max(1),
        })
    }

    async fn session(&self) -> Result<B2Session> {
        self.session
            .get_or_refresh(|| async {
                let credentials = STANDARD.encode(format!("{}:{}", self.key_id, self.application_key));
                let response = self
                    .client
                    .get(format!("{}/b2api/v2/b2_authorize_account", self.auth_url))
                    .header("Authorization", format!("Basic {}", credentials))
                    .send()
                    .await
                    .context("Backblaze authorization request failed")?;
                let session: B2Session = ensure_success(response, "Backblaze authorization")
                    .await?
                    .json()
                    .await?;
                Ok::<_, anyhow::Error>((session, SESSION_LIFETIME))
            })
            .await
    }

    /// POSTs to a `b2api/v2` call with the account token.
    async fn call<T: DeserializeOwned>(&self, operation: &str, body: &Value) -> Result<T> {
        let session = self.session().await?;
        let response = self
            .client
            .post(format!("{}/b2api/v2/{}", session.api_url, operation))
            .header("Authorization", &session.authorization_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Backblaze {} failed", operation))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.session.invalidate().await;
        }
        Ok(ensure_success(response, operation).await?.json().await?)
    }

    async fn find(&self, name: &str) -> Result<Option<B2File>> {
        let page: FileNames = self
            .call(
                "b2_list_file_names",
                &json!({
                    "bucketId": self.bucket_id,
                    "startFileName": name,
                    "prefix": name,
                    "maxFileCount": 1
                }),
            )
            .await?;
        Ok(page.files.into_iter().find(|f| f.file_name == name))
    }

    fn file_name(&self, locator: &str) -> String {
        join_key(self.directory.as_deref(), locator)
    }

    async fn upload_small(&self, local_path: &Path, name: &str) -> Result<()> {
        let sha1 = sha1_of_file(local_path).await?;
        let target: UploadTarget = self
            .call("b2_get_upload_url", &json!({ "bucketId": self.bucket_id }))
            .await?;
        let (body, size) = file_body(local_path).await?;
        let response = self
            .client
            .post(&target.upload_url)
            .header("Authorization", &target.authorization_token)
            .header("X-Bz-File-Name", percent_encode(name, true))
            .header("Content-Type", "b2/x-auto")
            .header("Content-Length", size)
            .header("X-Bz-Content-Sha1", sha1)
            .body(body)
            .send()
            .await?;
        ensure_success(response, "Backblaze upload").await?;
        Ok(())
    }

    async fn upload_large(&self, local_path: &Path, name: &str) -> Result<()> {
        let started: StartedFile = self
            .call(
                "b2_start_large_file",
                &json!({
                    "bucketId": self.bucket_id,
                    "fileName": name,
                    "contentType": "b2/x-auto"
                }),
            )
            .await?;

        match self.upload_parts(local_path, &started.file_id).await {
            Ok(part_hashes) => {
                let _: Value = self
                    .call(
                        "b2_finish_large_file",
                        &json!({ "fileId": started.file_id, "partSha1Array": part_hashes }),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                let cancelled: Result<Value> = self
                    .call("b2_cancel_large_file", &json!({ "fileId": started.file_id }))
                    .await;
                if let Err(cancel_err) = cancelled {
                    warn!("Failed to cancel large file {}: {:#}", started.file_id, cancel_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, local_path: &Path, file_id: &str) -> Result<Vec<String>> {
        let target: UploadTarget = self
            .call("b2_get_upload_part_url", &json!({ "fileId": file_id }))
            .await?;
        let mut file = File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;
        let mut hashes = Vec::new();
        loop {
            let chunk = read_chunk(&mut file, self.part_size as usize).await?;
            if chunk.is_empty() {
                break;
            }
            let part_number = hashes.len() + 1;
            let sha1 = hex::encode(Sha1::digest(&chunk));
            let response = self
                .client
                .post(&target.upload_url)
                .header("Authorization", &target.authorization_token)
                .header("X-Bz-Part-Number", part_number)
                .header("Content-Length", chunk.len())
                .header("X-Bz-Content-Sha1", &sha1)
                .body(chunk)
                .send()
                .await?;
            ensure_success(response, "Backblaze part upload").await?;
            debug!("Uploaded part {} of large file {}", part_number, file_id);
            hashes.push(sha1);
        }
        Ok(hashes)
    }
}

#[async_trait]
impl StorageBackend for BackblazeStorage {
    fn kind(&self) -> &'static str {
        "backblaze"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let name = self.file_name(remote_key);
        let size = tokio::fs::metadata(local_path).await?.len();
        info!("Uploading {} to B2 {}/{}", local_path.display(), self.bucket_name, name);
        if size > self.large_threshold {
            self.upload_large(local_path, &name).await?;
        } else {
            self.upload_small(local_path, &name).await?;
        }
        Ok(name)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let session = self.session().await?;
        let response = self
            .client
            .get(format!(
                "{}/file/{}/{}",
                session.download_url,
                self.bucket_name,
                percent_encode(locator, true)
            ))
            .header("Authorization", &session.authorization_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = ensure_success(response, "Backblaze download").await?;
        stream_to_file(response, local_path).await?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let Some(found) = self.find(locator).await? else {
            return Ok(false);
        };
        let file_id = found.file_id.context("Backblaze listing returned no fileId")?;
        let _: Value = self
            .call(
                "b2_delete_file_version",
                &json!({ "fileName": found.file_name, "fileId": file_id }),
            )
            .await?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        Ok(self.find(locator).await?.is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let full_prefix = self.file_name(prefix);
        let mut start: Option<String> = None;
        let mut files = Vec::new();
        loop {
            let mut body = json!({
                "bucketId": self.bucket_id,
                "prefix": full_prefix,
                "maxFileCount": 1000
            });
            if let Some(start) = start.take() {
                body["startFileName"] = Value::String(start);
            }
            let page: FileNames = self.call("b2_list_file_names", &body).await?;
            for file in page.files {
                files.push(RemoteFile {
                    name: super::base_name(&file.file_name),
                    size: file.content_length,
                    modified_at: file
                        .upload_timestamp
                        .and_then(DateTime::<Utc>::from_timestamp_millis),
                    path: file.file_name,
                });
            }
            match page.next_file_name {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        match self.session().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Backblaze authorization failed: {:#}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_auth(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/b2api/v2/b2_authorize_account"))
            .and(header("Authorization", "Basic a2V5OnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accountId": "acc",
                "authorizationToken": "acct-token",
                "apiUrl": server.uri(),
                "downloadUrl": server.uri()
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    fn storage(server: &MockServer) -> anyhow::Result<BackblazeStorage> {
        let settings = BackendSettings::new()
            .with("key_id", "key")
            .with("application_key", "secret")
            .with("bucket_id", "bid")
            .with("bucket_name", "site-backups")
            .with("directory", "nightly")
            .with("auth_url", server.uri());
        BackblazeStorage::from_settings(&settings, Client::new())
    }

    #[tokio::test]
    async fn test_authorization_is_cached_across_calls() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/b2api/v2/b2_get_upload_url"))
            .and(header("Authorization", "acct-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": format!("{}/upload", server.uri()),
                "authorizationToken": "upload-token"
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(header("X-Bz-File-Name", "nightly/a.tar.gz"))
            .and(header("X-Bz-Content-Sha1", "a9993e364706816aba3e25717850c26c9cd0d89d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fileId": "f1" })))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.tar.gz");
        std::fs::write(&file, b"abc")?;

        let backend = storage(&server)?;
        assert_eq!(backend.upload(&file, "a.tar.gz").await?, "nightly/a.tar.gz");
        assert_eq!(backend.upload(&file, "a.tar.gz").await?, "nightly/a.tar.gz");
        Ok(())
    }

    #[tokio::test]
    async fn test_exists_matches_exact_name() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("POST"))
            .and(path("/b2api/v2/b2_list_file_names"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{ "fileName": "nightly/a.tar.gz.old", "fileId": "x", "contentLength": 1 }],
                "nextFileName": null
            })))
            .mount(&server)
            .await;

        let backend = storage(&server)?;
        assert!(!backend.exists("nightly/a.tar.gz").await?);
        assert!(!backend.delete("nightly/a.tar.gz").await?);
        Ok(())
    }
}
