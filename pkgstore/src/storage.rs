//! Durable file primitives shared by the manifest, token and registry-list
//! documents.

use crate::error::{StorageError, StorageResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Prefix of in-flight files; never a valid package filename.
pub const TEMP_PREFIX: &str = ".tmp.";

/// Sibling temp path for `path`, unique per call.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{TEMP_PREFIX}{}-{name}", Uuid::new_v4()))
}

/// Save file content to `path` atomically: temp file, optional fsync, rename.
pub async fn save_file_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    fsync: bool,
) -> StorageResult<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    let written = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_ref()).await?;
        file.flush().await?;
        if fsync {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::Io(e));
    }

    debug!(
        path = %path.display(),
        size = content.as_ref().len(),
        "File saved atomically"
    );
    Ok(())
}

/// Read a file, mapping absence to `Ok(None)`.
pub async fn read_file_optional<P: AsRef<Path>>(path: P) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path.as_ref()).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Remove a file, mapping absence to `NotFound(what)`.
pub async fn remove_file<P: AsRef<Path>>(path: P, what: &str) -> StorageResult<()> {
    fs::remove_file(path.as_ref())
        .await
        .map_err(|e| StorageError::not_found_io(e, what))
}

/// Remove a directory tree; absent directories are not an error.
pub async fn remove_dir_all<P: AsRef<Path>>(path: P) -> StorageResult<()> {
    match fs::remove_dir_all(path.as_ref()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}
