use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::http::read_chunk;
use super::{join_key, BackendSettings, RemoteFile, StorageBackend};

const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
const PART_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub prefix: Option<String>,
    /// Path-style addressing for S3-compatible services (MinIO, Spaces).
    pub force_path_style: bool,
}

/// Amazon S3 and S3-compatible object stores. Locators are `s3://bucket/key`.
pub struct S3Storage {
    settings: S3Settings,
    client: OnceCell<s3::Client>,
}

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = url::Url::parse(s3_uri).with_context(|| format!("Invalid S3 URI format: {}", s3_uri))?;
    if uri.scheme() != "s3" {
        anyhow::bail!("S3 URI must start with s3://");
    }
    let bucket = uri.host_str().context("S3 URI missing bucket name")?.to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        anyhow::bail!("S3 URI missing key (object path)");
    }
    Ok((bucket, key))
}

impl S3Storage {
    pub fn new(settings: S3Settings) -> Self {
        Self {
            settings,
            client: OnceCell::new(),
        }
    }

    pub fn from_settings(settings: &BackendSettings, custom_endpoint: bool) -> Result<Self> {
        let endpoint_url = settings
            .get_str("endpoint")
            .or_else(|| settings.get_str("endpoint_url"))
            .map(str::to_string);
        if custom_endpoint && endpoint_url.is_none() {
            anyhow::bail!("missing required setting 'endpoint'");
        }
        let access_key_id = settings
            .get_str("access_key")
            .or_else(|| settings.get_str("access_key_id"))
            .context("missing required setting 'access_key'")?;
        let secret_access_key = settings
            .get_str("secret_key")
            .or_else(|| settings.get_str("secret_access_key"))
            .context("missing required setting 'secret_key'")?;

        Ok(Self::new(S3Settings {
            bucket: settings.require_str("bucket")?.to_string(),
            region: settings.get_str("region").unwrap_or(DEFAULT_REGION).to_string(),
            endpoint_url,
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            prefix: settings.get_dir("prefix"),
            force_path_style: custom_endpoint || settings.get_bool("path_style").unwrap_or(false),
        }))
    }

    async fn client(&self) -> &s3::Client {
        self.client
            .get_or_init(|| async {
                let cfg = &self.settings;
                let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
                    .region(Region::new(cfg.region.clone()))
                    .credentials_provider(s3::config::Credentials::new(
                        &cfg.access_key_id,
                        &cfg.secret_access_key,
                        None,
                        None,
                        "Static",
                    ));
                if let Some(endpoint) = &cfg.endpoint_url {
                    loader = loader.endpoint_url(endpoint);
                }
                let sdk_config = loader.load().await;
                let conf = s3::config::Builder::from(&sdk_config)
                    .force_path_style(cfg.force_path_style)
                    .build();
                s3::Client::from_conf(conf)
            })
            .await
    }

    /// Maps a locator or bare key to (bucket, key).
    fn locate(&self, locator: &str) -> Result<(String, String)> {
        if locator.starts_with("s3://") {
            parse_s3_uri(locator)
        } else {
            Ok((
                self.settings.bucket.clone(),
                join_key(self.settings.prefix.as_deref(), locator),
            ))
        }
    }

    async fn upload_multipart(&self, file_path: &Path, key: &str, size: u64) -> Result<()> {
        let client = self.client().await;
        let bucket = &self.settings.bucket;
        let created = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload for {}", key))?;
        let upload_id = created
            .upload_id()
            .context("Multipart upload started without an upload id")?
            .to_string();

        let result = self.upload_parts(file_path, key, &upload_id, size).await;
        let parts = match result {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort_err) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                return Err(e);
            }
        };

        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload for {}", key))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        file_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let client = self.client().await;
        let mut file = File::open(file_path)
            .await
            .with_context(|| format!("Failed to open {}", file_path.display()))?;
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut sent = 0u64;
        loop {
            let chunk = read_chunk(&mut file, PART_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            sent += chunk.len() as u64;
            let output = client
                .upload_part()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {} of {}", part_number, key))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            debug!("Uploaded part {} of {} ({}/{} bytes)", part_number, key, sent, size);
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let key = join_key(self.settings.prefix.as_deref(), remote_key);
        let bucket = &self.settings.bucket;
        let size = tokio::fs::metadata(local_path).await?.len();
        info!("Uploading {} to s3://{}/{}", local_path.display(), bucket, key);

        if size > MULTIPART_THRESHOLD {
            self.upload_multipart(local_path, &key, size).await?;
        } else {
            let body = ByteStream::from_path(local_path).await.with_context(|| {
                format!("Failed to create ByteStream from file: {}", local_path.display())
            })?;
            self.client()
                .await
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .with_context(|| {
                    format!(
                        "Failed to upload file {} to S3 bucket {} with key {}",
                        local_path.display(),
                        bucket,
                        key
                    )
                })?;
        }
        Ok(format!("s3://{}/{}", bucket, key))
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let (bucket, key) = self.locate(locator)?;
        let mut object = match self
            .client()
            .await
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    return Ok(false);
                }
                return Err(anyhow::Error::new(service)
                    .context(format!("Failed to get object s3://{}/{}", bucket, key)));
            }
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut output_file = File::create(local_path)
            .await
            .with_context(|| format!("Failed to create destination file: {}", local_path.display()))?;
        let mut total = 0usize;
        while let Some(bytes) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Download of s3://{}/{} interrupted", bucket, key))?
        {
            output_file.write_all(&bytes).await?;
            total += bytes.len();
        }
        output_file.flush().await?;
        debug!("Downloaded {} bytes from s3://{}/{}", total, bucket, key);
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        if !self.exists(locator).await? {
            return Ok(false);
        }
        let (bucket, key) = self.locate(locator)?;
        self.client()
            .await
            .delete_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", bucket, key))?;
        Ok(true)
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let (bucket, key) = self.locate(locator)?;
        match self
            .client()
            .await
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow::Error::new(service))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let client = self.client().await;
        let bucket = &self.settings.bucket;
        let full_prefix = join_key(self.settings.prefix.as_deref(), prefix);
        let mut files = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&full_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", bucket, full_prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                files.push(RemoteFile {
                    name: super::base_name(key),
                    path: format!("s3://{}/{}", bucket, key),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified_at: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0)),
                });
            }
            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        let bucket = &self.settings.bucket;
        match self.client().await.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Could not access bucket {}: {}", bucket, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() -> anyhow::Result<()> {
        let (bucket, key) = parse_s3_uri("s3://site-backups/nightly/backup_1.tar.gz")?;
        assert_eq!(bucket, "site-backups");
        assert_eq!(key, "nightly/backup_1.tar.gz");
        assert!(parse_s3_uri("https://example.com/a").is_err());
        assert!(parse_s3_uri("s3://bucket-only").is_err());
        Ok(())
    }

    #[test]
    fn test_bare_keys_use_configured_prefix() -> anyhow::Result<()> {
        let settings = BackendSettings::new()
            .with("bucket", "b")
            .with("access_key", "k")
            .with("secret_key", "s")
            .with("prefix", "/site/");
        let storage = S3Storage::from_settings(&settings, false)?;
        assert_eq!(
            storage.locate("backup_1.tar.gz")?,
            ("b".to_string(), "site/backup_1.tar.gz".to_string())
        );
        assert_eq!(
            storage.locate("s3://other/x.tar.gz")?,
            ("other".to_string(), "x.tar.gz".to_string())
        );
        assert!(!storage.settings.force_path_style);
        Ok(())
    }

    #[test]
    fn test_custom_endpoint_requires_endpoint() {
        let settings = BackendSettings::new()
            .with("bucket", "b")
            .with("access_key", "k")
            .with("secret_key", "s");
        assert!(S3Storage::from_settings(&settings, true).is_err());
    }
}
