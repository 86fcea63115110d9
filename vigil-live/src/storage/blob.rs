//! File-backed blob storage for alert snapshots and profile media.
//!
//! A save is two-phase: the payload goes to `<name>.tmp`, is fsynced, then
//! renamed into place. The returned reference is only handed out after the
//! rename, so a record can never point at a partially written file.
//!
//! References are public, prefix-relative paths
//! (`/uploads/alerts/1700000000123-9f2c4e1a.jpg`), never filesystem paths.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const TEMP_SUFFIX: &str = ".tmp";

/// Blob write/read failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a reference of this store: {0}")]
    ForeignReference(String),
}

/// Which attachment directory a store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobArea {
    /// Alert snapshot images
    Alerts,
    /// Profile photos and voice samples
    Profiles,
}

impl BlobArea {
    pub fn dir_name(self) -> &'static str {
        match self {
            BlobArea::Alerts => "alerts",
            BlobArea::Profiles => "profiles",
        }
    }
}

/// A file found in a blob directory.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub reference: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    /// Leftover from an interrupted save
    pub temporary: bool,
}

/// One attachment directory and the public prefix it is served under.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    public_base: String,
}

impl BlobStore {
    /// `uploads_root/<area>` served at `public_prefix/<area>`.
    pub fn new(uploads_root: impl AsRef<Path>, public_prefix: &str, area: BlobArea) -> Self {
        Self {
            dir: uploads_root.as_ref().join(area.dir_name()),
            public_base: format!("{}/{}", public_prefix.trim_end_matches('/'), area.dir_name()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Public URL prefix of this store's references.
    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    /// Write `payload` and return its reference.
    ///
    /// Creates the directory on first use.
    pub async fn save(&self, payload: &[u8], extension: &str) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = Self::file_name(extension);
        let final_path = self.dir.join(&name);
        let temp_path = self.dir.join(format!("{name}{TEMP_SUFFIX}"));

        if let Err(e) = Self::write_durable(&temp_path, payload).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        log::debug!("Stored blob {} ({} bytes)", final_path.display(), payload.len());
        Ok(format!("{}/{}", self.public_base, name))
    }

    async fn write_durable(path: &Path, payload: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// `<unix millis>-<8 hex>.<ext>`
    fn file_name(extension: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{millis}-{}.{}", &suffix[..8], Self::sanitize_extension(extension))
    }

    fn sanitize_extension(extension: &str) -> String {
        let cleaned: String = extension
            .trim_start_matches('.')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        if cleaned.is_empty() {
            "bin".to_string()
        } else {
            cleaned
        }
    }

    /// Map a reference back to its file. `None` for foreign or unsafe references.
    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let name = reference
            .strip_prefix(self.public_base.as_str())?
            .strip_prefix('/')?;
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        Some(self.dir.join(name))
    }

    /// Whether the referenced blob is on disk.
    pub async fn exists(&self, reference: &str) -> bool {
        match self.resolve(reference) {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Read a blob back.
    pub async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self
            .resolve(reference)
            .ok_or_else(|| StorageError::ForeignReference(reference.to_string()))?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Delete a blob. Returns `false` if it was already gone.
    pub async fn remove(&self, reference: &str) -> Result<bool, StorageError> {
        let path = self
            .resolve(reference)
            .ok_or_else(|| StorageError::ForeignReference(reference.to_string()))?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every regular file in the directory (empty if it does not exist yet).
    pub async fn list(&self) -> Result<Vec<BlobEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(BlobEntry {
                reference: format!("{}/{}", self.public_base, name),
                path: entry.path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                temporary: name.ends_with(TEMP_SUFFIX),
            });
        }
        Ok(entries)
    }
}
