use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{redirect, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::http::{
    ensure_success, file_body, location, percent_encode, request_token, resumable_upload,
    stream_to_file,
};
use super::token::TokenCache;
use super::{base_name, join_key, BackendSettings, RemoteFile, StorageBackend};

const API_URL: &str = "https://storage.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const RESUMABLE_THRESHOLD: u64 = 8 * 1024 * 1024;
const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    size: Option<String>,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

enum Credentials {
    ServiceAccount(ServiceAccountKey),
    Static(String),
}

/// Google Cloud Storage JSON API authenticated with a service account.
/// Locators are object names.
pub struct GoogleCloudStorage {
    client: Client,
    credentials: Credentials,
    token: TokenCache,
    bucket: String,
    prefix: Option<String>,
    api_url: String,
    resumable_threshold: u64,
    chunk_size: u64,
}

/// Signs the RS256 assertion exchanged for an access token.
fn sign_assertion(key: &ServiceAccountKey, audience: &str, now: DateTime<Utc>) -> Result<String> {
    let claims = Claims {
        iss: &key.client_email,
        scope: SCOPE,
        aud: audience,
        iat: now.timestamp(),
        exp: now.timestamp() + 3600,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .context("Service account private key is not a valid RSA PEM")?;
    encode(&Header::new(Algorithm::RS256), &claims, &signing_key).context("Failed to sign JWT assertion")
}

impl GoogleCloudStorage {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let credentials = if let Some(raw) = settings.get_str("service_account_json") {
            Credentials::ServiceAccount(
                serde_json::from_str(raw).context("Invalid service account JSON")?,
            )
        } else if let Some(path) = settings.get_str("key_file") {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read service account key {}", path))?;
            Credentials::ServiceAccount(
                serde_json::from_str(&raw).context("Invalid service account JSON")?,
            )
        } else if let Some(token) = settings.get_str("access_token") {
            Credentials::Static(token.to_string())
        } else {
            anyhow::bail!("missing required setting 'service_account_json'");
        };

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            credentials,
            token: TokenCache::new(),
            bucket: settings.require_str("bucket")?.to_string(),
            prefix: settings.get_dir("prefix"),
            api_url: settings
                .get_str("api_url")
                .unwrap_or(API_URL)
                .trim_end_matches('/')
                .to_string(),
            resumable_threshold: settings.get_u64("chunk_threshold").unwrap_or(RESUMABLE_THRESHOLD),
            chunk_size: settings.get_u64("chunk_size").unwrap_or(CHUNK_SIZE),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let key = match &self.credentials {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::ServiceAccount(key) => key,
        };
        self.token
            .get_or_refresh(|| async {
                let token_url = key.token_uri.as_deref().unwrap_or(TOKEN_URL);
                let assertion = sign_assertion(key, token_url, Utc::now())?;
                request_token(
                    &self.client,
                    token_url,
                    &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                )
                .await
            })
            .await
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_url,
            self.bucket,
            percent_encode(name, false)
        )
    }
}

#[async_trait]
impl StorageBackend for GoogleCloudStorage {
    fn kind(&self) -> &'static str {
        "google_cloud"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let name = join_key(self.prefix.as_deref(), remote_key);
        let size = tokio::fs::metadata(local_path).await?.len();
        let token = self.access_token().await?;
        let upload_url = format!("{}/upload/storage/v1/b/{}/o", self.api_url, self.bucket);
        info!("Uploading {} to gs://{}/{}", local_path.display(), self.bucket, name);

        if size <= self.resumable_threshold {
            let (body, size) = file_body(local_path).await?;
            let response = self
                .client
                .post(&upload_url)
                .query(&[("uploadType", "media"), ("name", name.as_str())])
                .bearer_auth(token)
                .header("Content-Type", "application/gzip")
                .header("Content-Length", size)
                .body(body)
                .send()
                .await?;
            ensure_success(response, "Cloud Storage upload").await?;
        } else {
            let response = self
                .client
                .post(&upload_url)
                .query(&[("uploadType", "resumable"), ("name", name.as_str())])
                .bearer_auth(token)
                .header("X-Upload-Content-Type", "application/gzip")
                .header("X-Upload-Content-Length", size)
                .header("Content-Length", 0)
                .send()
                .await?;
            let response = ensure_success(response, "Cloud Storage upload session").await?;
            let session_url = location(&response)?;
            resumable_upload(&self.client, &session_url, local_path, size, self.chunk_size).await?;
        }
        Ok(name)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.object_url(locator))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = ensure_success(response, "Cloud Storage download").await?;
        stream_to_file(response, local_path).await?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let token = self.access_token().await?;
        let response = self
            .client
            .delete(self.object_url(locator))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, "Cloud Storage delete").await?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.object_url(locator))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, "Cloud Storage metadata").await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let token = self.access_token().await?;
        let full_prefix = join_key(self.prefix.as_deref(), prefix);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/storage/v1/b/{}/o", self.api_url, self.bucket))
                .query(&[("prefix", full_prefix.as_str())])
                .bearer_auth(&token);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let page: ObjectList = ensure_success(request.send().await?, "Cloud Storage list")
                .await?
                .json()
                .await?;
            for object in page.items {
                files.push(RemoteFile {
                    name: base_name(&object.name),
                    size: object.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                    modified_at: object.updated,
                    path: object.name,
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
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/storage/v1/b/{}", self.api_url, self.bucket))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(server: &MockServer) -> anyhow::Result<GoogleCloudStorage> {
        let settings = BackendSettings::new()
            .with("access_token", "tok")
            .with("bucket", "site-bucket")
            .with("prefix", "backups")
            .with("api_url", server.uri());
        GoogleCloudStorage::from_settings(&settings)
    }

    #[tokio::test]
    async fn test_object_names_are_fully_encoded() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o/backups%2Fa.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "backups/a.tar.gz" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o/backups%2Fb.tar.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = storage(&server)?;
        assert!(backend.exists("backups/a.tar.gz").await?);
        assert!(!backend.exists("backups/b.tar.gz").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_small_upload_uses_media_request() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/site-bucket/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "backups/a.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "backups/a.tar.gz" })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.tar.gz");
        std::fs::write(&file, b"data")?;
        assert_eq!(storage(&server)?.upload(&file, "a.tar.gz").await?, "backups/a.tar.gz");
        Ok(())
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let key = ServiceAccountKey {
            client_email: "svc@example.iam.gserviceaccount.com".into(),
            private_key: "not a pem".into(),
            token_uri: None,
        };
        assert!(sign_assertion(&key, TOKEN_URL, Utc::now()).is_err());
    }
}
