use std::cmp::Ordering;
use std::path::Path;

use crate::backup::manifest::{BackupManifest, DATABASE_FILE, FILES_DIR};
use crate::database::Dialect;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveCheck {
    pub manifest: BackupManifest,
    /// Problems worth reporting that do not stop the restore.
    pub warnings: Vec<String>,
}

/// Compares dotted numeric versions; non-numeric parts compare as 0.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split(['.', '-', '+'])
            .take(3)
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ord = a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Checks an extracted archive before anything is written to the site.
///
/// A missing or unreadable manifest, a database dump from another dialect,
/// or a payload the manifest promises but the archive lacks are fatal. An
/// archive written by a newer release only produces a warning.
pub fn verify_archive(
    extract_dir: &Path,
    target_dialect: Dialect,
    want_database: bool,
    want_files: bool,
) -> Result<ArchiveCheck> {
    let manifest = BackupManifest::read_from(extract_dir)?;
    let mut warnings = Vec::new();

    let current = env!("CARGO_PKG_VERSION");
    if compare_versions(&manifest.app_version, current) == Ordering::Greater {
        warnings.push(format!(
            "Backup was created by version {} which is newer than {}",
            manifest.app_version, current
        ));
    }

    if want_database {
        match &manifest.database {
            Some(info) => {
                if info.dialect != target_dialect {
                    return Err(AppError::Validation(format!(
                        "backup holds a {} dump but the target database is {}",
                        info.dialect.as_str(),
                        target_dialect.as_str()
                    )));
                }
                if !extract_dir.join(DATABASE_FILE).is_file() {
                    return Err(AppError::Validation(format!(
                        "manifest lists a database but {} is missing",
                        DATABASE_FILE
                    )));
                }
            }
            None => warnings.push("Backup contains no database; skipping database restore".to_string()),
        }
    }

    if want_files && manifest.backup_type.includes_files() {
        if manifest.file_count > 0 && !extract_dir.join(FILES_DIR).is_dir() {
            return Err(AppError::Validation(format!(
                "manifest lists {} files but {}/ is missing",
                manifest.file_count, FILES_DIR
            )));
        }
    } else if want_files {
        warnings.push("Backup contains no files; skipping file restore".to_string());
    }

    Ok(ArchiveCheck { manifest, warnings })
}
