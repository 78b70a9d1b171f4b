//! Shared storage: the filesystem area holding spreadsheet inputs, PDF
//! outputs and installed fonts.
//!
//! The presence of a file at its derived target path is the only completion
//! signal in the system, so every write a poller can observe goes through a
//! staging file in the scratch area followed by a single rename.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tempfile::{NamedTempFile, TempDir, TempPath};
use thiserror::Error;
use tracing::{debug, info};

/// Private area under the storage root; never listed or addressable by name.
const SCRATCH_DIR: &str = ".scratch";

/// Spreadsheet formats accepted as conversion inputs.
pub const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls", "ods"];

/// Font formats accepted by the font installer.
pub const FONT_EXTENSIONS: &[&str] = &["ttf", "otf"];

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid filename '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("storage I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A caller-supplied filename that is safe to join onto the storage root.
///
/// Only ASCII letters, digits, `.`, `_`, `-` and spaces are accepted; names
/// may not start with a dot, contain `..`, or carry any path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafeName(String);

impl SafeName {
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let reject = |reason| {
            Err(StorageError::InvalidName {
                name: name.to_string(),
                reason,
            })
        };

        if name.is_empty() {
            return reject("name is empty");
        }
        if name.len() > MAX_NAME_LEN {
            return reject("name is too long");
        }
        if name.contains('/') || name.contains('\\') {
            return reject("path separators are not allowed");
        }
        if name.starts_with('.') || name.contains("..") {
            return reject("relative path components are not allowed");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        {
            return reject("name contains characters outside [A-Za-z0-9._- ]");
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        self.0
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    pub fn stem(&self) -> &str {
        self.0.rsplit_once('.').map_or(self.0.as_str(), |(stem, _)| stem)
    }

    pub fn has_extension(&self, allowed: &[&str]) -> bool {
        self.extension()
            .is_some_and(|ext| allowed.contains(&ext.as_str()))
    }

    /// The PDF name a conversion of this file produces: same basename, `.pdf`.
    pub fn pdf_target(&self) -> SafeName {
        SafeName(format!("{}.pdf", self.stem()))
    }
}

impl std::fmt::Display for SafeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct SharedStorage {
    root: PathBuf,
    scratch: PathBuf,
    fonts: PathBuf,
}

impl SharedStorage {
    /// Opens (creating if needed) the storage root, its scratch area and the
    /// fonts directory.
    pub fn open(root: impl Into<PathBuf>, fonts: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let fonts = fonts.into();
        let scratch = root.join(SCRATCH_DIR);

        for dir in [&root, &scratch, &fonts] {
            std::fs::create_dir_all(dir).map_err(StorageError::io(dir))?;
        }

        info!(
            root = %root.display(),
            fonts = %fonts.display(),
            "Shared storage ready"
        );

        Ok(Self {
            root,
            scratch,
            fonts,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn fonts_dir(&self) -> &Path {
        &self.fonts
    }

    pub fn path_of(&self, name: &SafeName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Whether a regular file exists under `name`. Re-reads the filesystem on
    /// every call.
    pub async fn exists(&self, name: &SafeName) -> Result<bool, StorageError> {
        let path = self.path_of(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path)(e)),
        }
    }

    /// Writes a new file under `name`, failing with `AlreadyExists` instead of
    /// replacing an existing one. The file appears fully written or not at all.
    pub async fn store_new(&self, name: &SafeName, data: Bytes) -> Result<PathBuf, StorageError> {
        let dest = self.path_of(name);
        write_noclobber(self.scratch.clone(), dest.clone(), name.to_string(), data).await?;
        debug!(path = %dest.display(), "Stored new file");
        Ok(dest)
    }

    /// Creates an empty staging file in the scratch area. Dropping the returned
    /// path removes the file, so abandoned conversions leave nothing behind.
    pub fn stage(&self) -> Result<TempPath, StorageError> {
        tempfile::Builder::new()
            .prefix(".stage-")
            .tempfile_in(&self.scratch)
            .map(NamedTempFile::into_temp_path)
            .map_err(StorageError::io(&self.scratch))
    }

    /// A private per-request directory in the scratch area, removed on drop.
    pub fn scratch_area(&self) -> Result<TempDir, StorageError> {
        tempfile::Builder::new()
            .prefix(".job-")
            .tempdir_in(&self.scratch)
            .map_err(StorageError::io(&self.scratch))
    }

    /// Atomically renames a staged file onto `dest`, replacing whatever was
    /// there. `dest` must live on the same filesystem as the scratch area.
    pub fn commit_to(&self, staged: TempPath, dest: &Path) -> Result<(), StorageError> {
        staged
            .persist(dest)
            .map_err(|e| StorageError::io(dest)(e.error))?;
        debug!(path = %dest.display(), "Committed staged file");
        Ok(())
    }

    /// Opens `name` for reading. `Ok(None)` means the file is not there (yet).
    pub async fn open_file(
        &self,
        name: &SafeName,
    ) -> Result<Option<(tokio::fs::File, u64)>, StorageError> {
        let path = self.path_of(name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path)(e)),
        };
        let meta = file.metadata().await.map_err(StorageError::io(&path))?;
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some((file, meta.len())))
    }

    /// Removes `name` if present. Returns whether a file was actually removed;
    /// an absent file is not an error.
    pub async fn delete(&self, name: &SafeName) -> Result<bool, StorageError> {
        let path = self.path_of(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Delete of absent file");
                Ok(false)
            }
            Err(e) => Err(StorageError::io(&path)(e)),
        }
    }

    /// Lists regular files in the storage root, optionally filtered by
    /// extension, sorted by name. Dot-files and the scratch area are skipped.
    pub async fn list(&self, extension: Option<&str>) -> Result<Vec<StoredFile>, StorageError> {
        let mut files = list_dir(&self.root).await?;
        if let Some(ext) = extension {
            let suffix = format!(".{}", ext.to_ascii_lowercase());
            files.retain(|f| f.name.to_ascii_lowercase().ends_with(&suffix));
        }
        Ok(files)
    }

    /// Installs a font file. Fonts are write-once: an existing name is
    /// reported as `AlreadyExists`.
    pub async fn install_font(&self, name: &SafeName, data: Bytes) -> Result<PathBuf, StorageError> {
        if !name.has_extension(FONT_EXTENSIONS) {
            return Err(StorageError::InvalidName {
                name: name.to_string(),
                reason: "only .ttf and .otf fonts are allowed",
            });
        }
        let dest = self.fonts.join(name.as_str());
        write_noclobber(self.fonts.clone(), dest.clone(), name.to_string(), data).await?;
        info!(path = %dest.display(), "Installed font");
        Ok(dest)
    }

    pub async fn list_fonts(&self) -> Result<Vec<StoredFile>, StorageError> {
        list_dir(&self.fonts).await
    }
}

async fn write_noclobber(
    tmp_dir: PathBuf,
    dest: PathBuf,
    display_name: String,
    data: Bytes,
) -> Result<(), StorageError> {
    let dest_for_err = dest.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
        let mut tmp = NamedTempFile::new_in(&tmp_dir).map_err(StorageError::io(&tmp_dir))?;
        tmp.write_all(&data).map_err(StorageError::io(tmp.path()))?;
        tmp.as_file().sync_all().map_err(StorageError::io(&dest))?;
        tmp.persist_noclobber(&dest).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists(display_name)
            } else {
                StorageError::io(&dest)(e.error)
            }
        })?;
        Ok(())
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(join) => Err(StorageError::Io {
            path: dest_for_err,
            source: io::Error::new(io::ErrorKind::Other, join),
        }),
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<StoredFile>, StorageError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(StorageError::io(dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StorageError::io(dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata().await.map_err(StorageError::io(dir))?;
        if meta.is_file() {
            files.push(StoredFile {
                name,
                size: meta.len(),
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
