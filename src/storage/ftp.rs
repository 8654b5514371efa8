use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream, Mode, Status};
use tracing::{debug, info, warn};

use super::{base_name, join_key, BackendSettings, RemoteFile, StorageBackend};

const DEFAULT_PORT: u64 = 21;

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub directory: Option<String>,
    pub passive: bool,
}

/// Plain FTP via suppaftp's blocking client. The control connection is
/// opened lazily, reused between calls and dropped after any failure.
pub struct FtpStorage {
    settings: Arc<FtpSettings>,
    conn: Arc<Mutex<Option<FtpStream>>>,
}

/// 550: the file does not exist (or is not accessible).
fn is_unavailable(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

fn connect(settings: &FtpSettings) -> FtpResult<FtpStream> {
    let mut ftp = FtpStream::connect((settings.host.as_str(), settings.port))?;
    ftp.login(&settings.username, &settings.password)?;
    ftp.transfer_type(FileType::Binary)?;
    ftp.set_mode(if settings.passive { Mode::Passive } else { Mode::Active });
    debug!("Connected to ftp://{}:{}", settings.host, settings.port);
    Ok(ftp)
}

/// Creates each missing segment of `dir`; existing ones answer 550.
fn ensure_dirs(ftp: &mut FtpStream, dir: &str) -> FtpResult<()> {
    let mut current = String::new();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        match ftp.mkdir(&current) {
            Ok(()) => {}
            Err(e) if is_unavailable(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl FtpStorage {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let port = settings.get_u64("port").unwrap_or(DEFAULT_PORT);
        let port = u16::try_from(port).with_context(|| format!("invalid FTP port {}", port))?;
        Ok(Self {
            settings: Arc::new(FtpSettings {
                host: settings.require_str("host")?.to_string(),
                port,
                username: settings.get_str("username").unwrap_or("anonymous").to_string(),
                password: settings.get_str("password").unwrap_or_default().to_string(),
                directory: settings.get_dir("directory"),
                passive: settings.get_bool("passive").unwrap_or(true),
            }),
            conn: Arc::new(Mutex::new(None)),
        })
    }

    fn remote_path(&self, locator: &str) -> String {
        join_key(self.settings.directory.as_deref(), locator)
    }

    /// Runs `op` on the shared connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut guard = conn.lock();
            if guard.is_none() {
                *guard = Some(connect(&settings).with_context(|| {
                    format!("FTP connection to {}:{} failed", settings.host, settings.port)
                })?);
            }
            let Some(ftp) = guard.as_mut() else {
                anyhow::bail!("FTP connection unavailable");
            };
            match op(ftp) {
                Ok(value) => Ok(value),
                Err(e) => {
                    if let Some(mut stale) = guard.take() {
                        let _ = stale.quit();
                    }
                    Err(e.into())
                }
            }
        })
        .await
        .context("FTP task panicked")?
    }
}

#[async_trait]
impl StorageBackend for FtpStorage {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let remote = self.remote_path(remote_key);
        let local: PathBuf = local_path.to_path_buf();
        let dir = self.settings.directory.clone();
        info!("Uploading {} to FTP {}", local.display(), remote);
        let target = remote.clone();
        self.with_connection(move |ftp| {
            if let Some(dir) = &dir {
                ensure_dirs(ftp, dir)?;
            }
            let mut file = std::fs::File::open(&local).map_err(FtpError::ConnectionError)?;
            ftp.put_file(&target, &mut file)?;
            Ok(())
        })
        .await?;
        Ok(remote)
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let remote = self.remote_path(locator);
        let local = local_path.to_path_buf();
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let found = self
            .with_connection(move |ftp| {
                let mut out = std::fs::File::create(&local).map_err(FtpError::ConnectionError)?;
                let result = ftp.retr(&remote, |reader| {
                    io::copy(reader, &mut out).map_err(FtpError::ConnectionError)
                });
                match result {
                    Ok(_) => Ok(true),
                    Err(e) if is_unavailable(&e) => {
                        drop(out);
                        let _ = std::fs::remove_file(&local);
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(found)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let remote = self.remote_path(locator);
        self.with_connection(move |ftp| match ftp.rm(&remote) {
            Ok(()) => Ok(true),
            Err(e) if is_unavailable(&e) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let remote = self.remote_path(locator);
        self.with_connection(move |ftp| match ftp.size(&remote) {
            Ok(_) => Ok(true),
            Err(e) if is_unavailable(&e) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let dir = self.settings.directory.clone();
        let prefix = prefix.to_string();
        self.with_connection(move |ftp| {
            let names = match ftp.nlst(dir.as_deref()) {
                Ok(names) => names,
                Err(e) if is_unavailable(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut files = Vec::new();
            for entry in names {
                let name = base_name(&entry);
                if !name.starts_with(&prefix) {
                    continue;
                }
                let path = join_key(dir.as_deref(), &name);
                // Directories have no SIZE.
                let Ok(size) = ftp.size(&path) else { continue };
                let modified_at = ftp
                    .mdtm(&path)
                    .ok()
                    .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
                files.push(RemoteFile {
                    name,
                    path,
                    size: size as u64,
                    modified_at,
                });
            }
            Ok(files)
        })
        .await
    }

    async fn test_connection(&self) -> Result<bool> {
        match self.with_connection(|ftp| ftp.noop()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("FTP connection test failed: {:#}", e);
                Ok(false)
            }
        }
    }
}
