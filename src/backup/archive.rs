// sitevault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tar::Builder;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Packs `source_dir` into a gzip-compressed tar at `archive_dest_path`.
///
/// Entry paths are relative to `source_dir`; directories are written as their
/// own entries so empty ones survive the round trip. `level` runs from 0
/// (stored) to 9 (smallest). Returns the archive size in bytes.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path, level: u32) -> Result<u64> {
    if !source_dir.is_dir() {
        anyhow::bail!("Source for archival is not a directory: {}", source_dir.display());
    }
    if level > 9 {
        anyhow::bail!("Compression level must be between 0 and 9, got {}", level);
    }
    if let Some(parent) = archive_dest_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create parent directory for archive: {}", parent.display())
        })?;
    }

    info!(
        "Creating tar.gz archive from {} to {} (level {})",
        source_dir.display(),
        archive_dest_path.display(),
        level
    );

    let archive_file = File::create(archive_dest_path)
        .with_context(|| format!("Failed to create archive file: {}", archive_dest_path.display()))?;
    let enc = GzEncoder::new(BufWriter::new(archive_file), Compression::new(level));
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!("Failed to strip prefix {} from {}", source_dir.display(), path.display())
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            tar_builder
                .append_dir(name, path)
                .with_context(|| format!("Failed to append directory {} to archive", path.display()))?;
        } else if file_type.is_file() {
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), name.display())
            })?;
        } else {
            debug!("Skipping non-regular entry {}", path.display());
        }
    }

    let encoder = tar_builder.into_inner().with_context(|| {
        format!("Failed to finish tar stream for archive: {}", archive_dest_path.display())
    })?;
    let mut writer = encoder.finish().with_context(|| {
        format!("Failed to finish Gzip encoding for archive: {}", archive_dest_path.display())
    })?;
    std::io::Write::flush(&mut writer)
        .with_context(|| format!("Failed to flush archive: {}", archive_dest_path.display()))?;
    drop(writer);

    let size = fs::metadata(archive_dest_path)
        .with_context(|| format!("Failed to stat archive: {}", archive_dest_path.display()))?
        .len();
    info!("Archive created at {} ({} bytes)", archive_dest_path.display(), size);
    Ok(size)
}

/// Unpacks a gzip-compressed tar into `extract_to_dir`. Entries that would
/// land outside the destination are rejected.
pub fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<()> {
    if !archive_path.is_file() {
        anyhow::bail!("Archive for extraction is not a file: {}", archive_path.display());
    }
    fs::create_dir_all(extract_to_dir).with_context(|| {
        format!("Failed to create extraction directory: {}", extract_to_dir.display())
    })?;

    info!(
        "Extracting tar.gz archive from {} to {}",
        archive_path.display(),
        extract_to_dir.display()
    );

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(archive_file));
    archive.set_preserve_mtime(true);

    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read archive entries: {}", archive_path.display()))?
    {
        let mut entry = entry.context("Corrupt archive entry")?;
        let entry_path = entry.path().context("Archive entry has an invalid path")?.into_owned();
        let unpacked = entry.unpack_in(extract_to_dir).with_context(|| {
            format!("Failed to unpack {} from {}", entry_path.display(), archive_path.display())
        })?;
        if !unpacked {
            anyhow::bail!(
                "Archive entry {} escapes the extraction directory",
                entry_path.display()
            );
        }
    }

    info!("Archive extracted to {}", extract_to_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_layout_and_empty_dirs() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        fs::create_dir_all(src.path().join("files/wp-content/uploads"))?;
        fs::create_dir_all(src.path().join("files/empty"))?;
        fs::write(src.path().join("manifest.json"), b"{}")?;
        fs::write(src.path().join("files/wp-content/uploads/a.txt"), b"hello")?;

        let out = tempfile::tempdir()?;
        let archive = out.path().join("b.tar.gz");
        let size = create_tar_gz_archive(src.path(), &archive, 9)?;
        assert!(size > 0);

        let dest = tempfile::tempdir()?;
        extract_tar_gz_archive(&archive, dest.path())?;
        assert_eq!(fs::read(dest.path().join("files/wp-content/uploads/a.txt"))?, b"hello");
        assert_eq!(fs::read(dest.path().join("manifest.json"))?, b"{}");
        assert!(dest.path().join("files/empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_level_zero_is_accepted_and_ten_rejected() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        fs::write(src.path().join("x"), vec![b'a'; 4096])?;
        let out = tempfile::tempdir()?;

        let stored = create_tar_gz_archive(src.path(), &out.path().join("0.tar.gz"), 0)?;
        let packed = create_tar_gz_archive(src.path(), &out.path().join("9.tar.gz"), 9)?;
        assert!(packed < stored);
        assert!(create_tar_gz_archive(src.path(), &out.path().join("10.tar.gz"), 10).is_err());
        Ok(())
    }
}
