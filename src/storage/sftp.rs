use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{base_name, join_key, BackendSettings, RemoteFile, StorageBackend};

const DEFAULT_PORT: u64 = 22;
const DEFAULT_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub private_key_password: Option<String>,
    pub directory: Option<String>,
    /// Keep the directory rooted at `/` instead of the login directory.
    pub absolute: bool,
    pub timeout: Duration,
    /// SHA-256 fingerprint the server key must match, base64 as printed by
    /// `ssh-keygen -l`, with or without the `SHA256:` prefix.
    pub host_key_fingerprint: Option<String>,
}

/// SFTP over russh. Every operation opens its own SSH session and closes it
/// when done.
pub struct SftpStorage {
    settings: Arc<SftpSettings>,
}

struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected {
            Some(expected) => {
                let matches = expected.trim_start_matches("SHA256:") == fingerprint;
                if !matches {
                    warn!("Host key of {} (SHA256:{}) does not match the configured fingerprint", self.host, fingerprint);
                }
                Ok(matches)
            }
            None => {
                warn!("Accepting unverified host key SHA256:{} for {}", fingerprint, self.host);
                Ok(true)
            }
        }
    }
}

/// An authenticated session with its SFTP channel.
struct Connection {
    ssh: Handle<HostKeyCheck>,
    sftp: SftpSession,
}

impl Connection {
    async fn close(self) {
        drop(self.sftp);
        let _ = self
            .ssh
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

async fn connect(settings: &SftpSettings) -> Result<Connection> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(settings.timeout),
        ..Default::default()
    });
    let handler = HostKeyCheck {
        host: settings.host.clone(),
        expected: settings.host_key_fingerprint.clone(),
    };
    let addr = (settings.host.as_str(), settings.port);
    let mut ssh = tokio::time::timeout(settings.timeout, client::connect(config, addr, handler))
        .await
        .context("SSH handshake timed out")??;

    let authenticated = match &settings.private_key {
        Some(key_path) => {
            let key = russh_keys::load_secret_key(key_path, settings.private_key_password.as_deref())
                .with_context(|| format!("cannot load private key {}", key_path.display()))?;
            ssh.authenticate_publickey(&settings.username, Arc::new(key)).await?
        }
        None => {
            let password = settings.password.as_deref().unwrap_or_default();
            ssh.authenticate_password(&settings.username, password).await?
        }
    };
    if !authenticated {
        anyhow::bail!("SFTP authentication failed for {}", settings.username);
    }

    let channel = ssh.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    let sftp = SftpSession::new(channel.into_stream()).await?;
    debug!("Connected to sftp://{}:{}", settings.host, settings.port);
    Ok(Connection { ssh, sftp })
}

/// Creates each missing segment of `dir`.
async fn ensure_dirs(sftp: &SftpSession, dir: &str, absolute: bool) -> Result<()> {
    let mut current = if absolute { "/".to_string() } else { String::new() };
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);
        if !sftp.try_exists(current.as_str()).await? {
            sftp.create_dir(current.as_str()).await?;
        }
    }
    Ok(())
}

impl SftpStorage {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let port = settings.get_u64("port").unwrap_or(DEFAULT_PORT);
        let port = u16::try_from(port).with_context(|| format!("invalid SFTP port {}", port))?;
        let private_key = settings.get_str("private_key").map(PathBuf::from);
        let password = settings.get_str("password").map(str::to_string);
        if private_key.is_none() && password.is_none() {
            anyhow::bail!("either password or private_key must be set");
        }
        Ok(Self {
            settings: Arc::new(SftpSettings {
                host: settings.require_str("host")?.to_string(),
                port,
                username: settings.require_str("username")?.to_string(),
                password,
                private_key,
                private_key_password: settings.get_str("private_key_password").map(str::to_string),
                directory: settings.get_dir("directory"),
                absolute: settings
                    .get_str("directory")
                    .is_some_and(|d| d.trim().starts_with('/')),
                timeout: Duration::from_secs(
                    settings.get_u64("timeout").unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
                host_key_fingerprint: settings.get_str("host_key_fingerprint").map(str::to_string),
            }),
        })
    }

    fn remote_path(&self, locator: &str) -> String {
        let path = join_key(self.settings.directory.as_deref(), locator);
        if self.settings.absolute {
            format!("/{}", path)
        } else {
            path
        }
    }

    /// Runs `op` on a fresh connection and closes it afterwards.
    async fn with_connection<T>(
        &self,
        op: impl for<'a> FnOnce(&'a SftpSession) -> BoxFuture<'a, Result<T>> + Send,
    ) -> Result<T>
    where
        T: Send,
    {
        let conn = connect(&self.settings).await.with_context(|| {
            format!("SFTP connection to {}:{} failed", self.settings.host, self.settings.port)
        })?;
        let result = op(&conn.sftp).await;
        conn.close().await;
        result
    }
}

#[async_trait]
impl StorageBackend for SftpStorage {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let remote = self.remote_path(remote_key);
        info!("Uploading {} to SFTP {}", local_path.display(), remote);
        let mut local = tokio::fs::File::open(local_path).await?;
        let dir = self.settings.directory.clone();
        let absolute = self.settings.absolute;
        let target = remote.clone();
        self.with_connection(move |sftp| {
            Box::pin(async move {
                if let Some(dir) = &dir {
                    ensure_dirs(sftp, dir, absolute).await?;
                }
                let mut file = sftp.create(target.as_str()).await?;
                tokio::io::copy(&mut local, &mut file).await?;
                file.shutdown().await?;
                Ok(())
            })
        })
        .await?;
        Ok(remote)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let remote = self.remote_path(locator);
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let local = local_path.to_path_buf();
        self.with_connection(move |sftp| {
            Box::pin(async move {
                if !sftp.try_exists(remote.as_str()).await? {
                    return Ok(false);
                }
                let mut file = sftp.open(remote.as_str()).await?;
                let mut out = tokio::fs::File::create(&local).await?;
                tokio::io::copy(&mut file, &mut out).await?;
                out.flush().await?;
                Ok(true)
            })
        })
        .await
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let remote = self.remote_path(locator);
        self.with_connection(move |sftp| {
            Box::pin(async move {
                if !sftp.try_exists(remote.as_str()).await? {
                    return Ok(false);
                }
                sftp.remove_file(remote.as_str()).await?;
                Ok(true)
            })
        })
        .await
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let remote = self.remote_path(locator);
        self.with_connection(move |sftp| {
            Box::pin(async move { Ok(sftp.try_exists(remote.as_str()).await?) })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let dir = match &self.settings.directory {
            Some(dir) if self.settings.absolute => format!("/{}", dir),
            Some(dir) => dir.clone(),
            None => ".".to_string(),
        };
        let prefix = prefix.to_string();
        let storage_dir = self.settings.directory.clone();
        let absolute = self.settings.absolute;
        self.with_connection(move |sftp| {
            Box::pin(async move {
                if !sftp.try_exists(dir.as_str()).await? {
                    return Ok(Vec::new());
                }
                let mut files = Vec::new();
                for entry in sftp.read_dir(dir.as_str()).await? {
                    let name = base_name(&entry.file_name());
                    let metadata = entry.metadata();
                    if !name.starts_with(&prefix) || metadata.is_dir() {
                        continue;
                    }
                    let path = join_key(storage_dir.as_deref(), &name);
                    files.push(RemoteFile {
                        name,
                        path: if absolute { format!("/{}", path) } else { path },
                        size: metadata.size.unwrap_or(0),
                        modified_at: metadata
                            .mtime
                            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0)),
                    });
                }
                Ok(files)
            })
        })
        .await
    }

    async fn test_connection(&self) -> Result<bool> {
        let outcome = self
            .with_connection(|sftp| Box::pin(async move { Ok(sftp.canonicalize(".").await?) }))
            .await;
        match outcome {
            Ok(home) => {
                debug!("SFTP login directory is {}", home);
                Ok(true)
            }
            Err(e) => {
                warn!("SFTP connection test failed: {:#}", e);
                Ok(false)
            }
        }
    }
}
