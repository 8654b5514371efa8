use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::catalog::Catalog;
use crate::errors::{AppError, Result};

/// Paths never worth backing up, matched as substrings of the site-relative path.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "wp-content/cache",
    "wp-content/uploads/sitevault",
    ".git",
    ".svn",
    "node_modules",
    ".DS_Store",
    "Thumbs.db",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedFiles {
    /// Site-relative paths of regular files.
    pub files: Vec<PathBuf>,
    /// Site-relative directories that must exist even when empty.
    pub directories: Vec<PathBuf>,
    pub total_size: u64,
}

impl CollectedFiles {
    pub fn count(&self) -> usize {
        self.files.len()
    }
}

#[derive(Debug, Clone)]
pub struct FileCollector {
    root: PathBuf,
    exclusions: Vec<String>,
}

impl FileCollector {
    pub fn new(root: impl Into<PathBuf>, extra: impl IntoIterator<Item = String>) -> Self {
        let mut exclusions: Vec<String> = DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        for pattern in extra {
            let pattern = pattern.trim().trim_start_matches("./").trim_matches('/').to_string();
            if !pattern.is_empty() && !exclusions.contains(&pattern) {
                exclusions.push(pattern);
            }
        }
        Self {
            root: root.into(),
            exclusions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        let normalized = relative_key(relative);
        self.exclusions.iter().any(|pattern| normalized.contains(pattern.as_str()))
    }

    /// Every non-excluded file under the root.
    pub fn collect_full(&self) -> Result<CollectedFiles> {
        self.collect(None)
    }

    /// Files modified strictly after `since`. Directories are not reported.
    pub fn collect_changed_since(&self, since: DateTime<Utc>) -> Result<CollectedFiles> {
        self.collect(Some(since))
    }

    fn collect(&self, since: Option<DateTime<Utc>>) -> Result<CollectedFiles> {
        if !self.root.is_dir() {
            return Err(AppError::Validation(format!(
                "site root {} is not a directory",
                self.root.display()
            )));
        }

        let mut collected = CollectedFiles::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.entry_excluded(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable path during collection: {}", e);
                    continue;
                }
            };
            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };

            if entry.file_type().is_dir() {
                if since.is_none() {
                    collected.directories.push(relative);
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry.metadata()?;
            if let Some(since) = since {
                let modified: DateTime<Utc> = metadata.modified()?.into();
                if modified <= since {
                    continue;
                }
            }
            collected.total_size += metadata.len();
            collected.files.push(relative);
        }

        debug!(
            "Collected {} files ({} bytes) under {}",
            collected.files.len(),
            collected.total_size,
            self.root.display()
        );
        Ok(collected)
    }

    fn entry_excluded(&self, entry: &DirEntry) -> bool {
        match entry.path().strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => self.is_excluded(rel),
            _ => false,
        }
    }
}

/// Collects the files changed since the parent backup was created.
pub fn collect_incremental(
    catalog: &Catalog,
    collector: &FileCollector,
    parent_id: u64,
) -> Result<CollectedFiles> {
    let parent = catalog
        .get_backup(parent_id)
        .ok_or(AppError::ParentNotFound(parent_id))?;
    collector.collect_changed_since(parent.created_at)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub copied: usize,
    pub failed: usize,
}

/// Copies collected files from `root` into `dest`, keeping relative paths.
/// A file that cannot be copied is logged and skipped.
pub fn stage_files(
    root: &Path,
    collected: &CollectedFiles,
    dest: &Path,
    on_file: &(dyn Fn(usize, usize, &Path) + Send + Sync),
) -> Result<StageSummary> {
    fs::create_dir_all(dest)?;
    for dir in &collected.directories {
        fs::create_dir_all(dest.join(dir))?;
    }

    let mut summary = StageSummary::default();
    let total = collected.files.len();
    for (idx, relative) in collected.files.iter().enumerate() {
        on_file(idx, total, relative);
        let target = dest.join(relative);
        let copy = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::copy(root.join(relative), &target));
        match copy {
            Ok(_) => summary.copied += 1,
            Err(e) => {
                warn!("Failed to copy {}: {}", relative.display(), e);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

fn relative_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
