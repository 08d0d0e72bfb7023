// hommss-backup/src/backup/archive.rs
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::{FileOptions, SimpleFileOptions};
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{BackupError, Result};

/// Incrementally builds a zip container, optionally AES-256 encrypting
/// every entry with `password`.
pub struct ArchiveBuilder {
    dest: PathBuf,
    password: Option<String>,
    writer: ZipWriter<File>,
    entries: usize,
}

impl ArchiveBuilder {
    pub fn create(dest: &Path, password: Option<&str>) -> Result<Self> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                BackupError::Archive(format!(
                    "Failed to create parent directory for archive {}: {}",
                    dest.display(),
                    e
                ))
            })?;
        }
        let file = File::create(dest).map_err(|e| {
            BackupError::Archive(format!("Failed to create archive file {}: {}", dest.display(), e))
        })?;

        tracing::debug!("Creating zip archive at {}", dest.display());
        Ok(ArchiveBuilder {
            dest: dest.to_path_buf(),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            writer: ZipWriter::new(file),
            entries: 0,
        })
    }

    /// Adds `src` as the entry `name`.
    pub fn add_file(&mut self, src: &Path, name: &str) -> Result<()> {
        let mut input = File::open(src).map_err(|e| {
            BackupError::Archive(format!("Failed to open {} for archiving: {}", src.display(), e))
        })?;
        self.writer.start_file(name, entry_options(self.password.as_deref()))?;
        io::copy(&mut input, &mut self.writer).map_err(|e| {
            BackupError::Archive(format!(
                "Failed to append file {} as {} to archive: {}",
                src.display(),
                name,
                e
            ))
        })?;
        self.entries += 1;
        Ok(())
    }

    /// Adds every regular file under `root` as `<prefix>/<relative path>`.
    /// Directory entries are not stored. Returns the number of files added.
    pub fn add_dir(&mut self, root: &Path, prefix: &str) -> Result<usize> {
        if !root.is_dir() {
            return Err(BackupError::Archive(format!(
                "Source for archival is not a directory: {}",
                root.display()
            )));
        }

        let mut added = 0;
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                BackupError::Archive(format!("Failed to walk directory {}: {}", root.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).map_err(|e| {
                BackupError::Archive(format!(
                    "Failed to strip prefix {} from {}: {}",
                    root.display(),
                    entry.path().display(),
                    e
                ))
            })?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let name = if prefix.is_empty() {
                relative
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), relative)
            };
            self.add_file(entry.path(), &name)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(self) -> Result<PathBuf> {
        self.writer.finish()?;
        tracing::debug!("✓ Zip archive written to {} ({} entries)", self.dest.display(), self.entries);
        Ok(self.dest)
    }
}

fn entry_options(password: Option<&str>) -> FileOptions<'_, ()> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    match password {
        Some(password) => options.with_aes_encryption(AesMode::Aes256, password),
        None => options,
    }
}

fn open_archive(archive: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive).map_err(|e| {
        BackupError::Archive(format!("Failed to open archive file {}: {}", archive.display(), e))
    })?;
    ZipArchive::new(file)
        .map_err(|e| BackupError::Archive(format!("{} is not a readable zip archive: {}", archive.display(), e)))
}

/// Entry names in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let zip = open_archive(archive)?;
    Ok(zip.file_names().map(str::to_string).collect())
}

/// True when any entry of the zip at `path` is encrypted. Unreadable files
/// count as unprotected.
pub fn is_password_protected(path: &Path) -> bool {
    let Ok(mut zip) = open_archive(path) else {
        return false;
    };
    (0..zip.len()).any(|i| zip.by_index_raw(i).map(|f| f.encrypted()).unwrap_or(false))
}

/// Extracts every entry under `dest`, decrypting with `password` where an
/// entry is encrypted. Returns the extracted file paths.
pub fn extract(archive: &Path, dest: &Path, password: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut zip = open_archive(archive)?;
    fs::create_dir_all(dest)?;

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let encrypted = zip.by_index_raw(i)?.encrypted();
        let mut entry = match (encrypted, password) {
            (false, _) => zip.by_index(i)?,
            (true, Some(pw)) => zip.by_index_decrypt(i, pw.as_bytes()).map_err(|e| match e {
                ZipError::InvalidPassword => BackupError::Archive(format!(
                    "Wrong archive password for {}",
                    archive.display()
                )),
                other => BackupError::from(other),
            })?,
            (true, None) => {
                return Err(BackupError::Archive(format!(
                    "{} is password protected but no archive password is configured",
                    archive.display()
                )));
            }
        };

        let Some(relative) = entry.enclosed_name() else {
            return Err(BackupError::Archive(format!(
                "Refusing to extract unsafe path {} from {}",
                entry.name(),
                archive.display()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            BackupError::Archive(format!("Failed to extract {} from {}: {}", target.display(), archive.display(), e))
        })?;
        extracted.push(target);
    }

    tracing::debug!("✓ Extracted {} files from {} to {}", extracted.len(), archive.display(), dest.display());
    Ok(extracted)
}
