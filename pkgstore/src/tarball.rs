//! # Tarball Lifecycle
//!
//! Streaming writes and reads of package tarballs on the local filesystem.
//!
//! A write goes through `Open → Writing → {Committed | Aborted}`. Bytes land in
//! a uniquely named temp file next to the final path, so readers and
//! [`TarballManager::has_file`] never observe a partial artifact. `done()`
//! publishes the file with a single link/rename; `abort()` (or dropping an
//! unfinished upload) deletes the temp file before returning.
//!
//! Neither direction buffers a whole tarball: writes are awaited chunk by
//! chunk, reads are produced lazily in `chunk_size` pieces as the consumer
//! polls.

use crate::error::{StorageError, StorageResult};
use crate::hash_utils::StreamingDigest;
use crate::manifest::Attachment;
use crate::storage::{temp_path_for, TEMP_PREFIX};
use crate::validation::{validate_filename, validate_package_name};
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default chunk size for streaming reads (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const TARBALL_CONTENT_TYPE: &str = "application/octet-stream";

/// Cancels the streaming calls it handed signals to.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal threaded into every streaming call.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires; pends forever if it never can.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Lifecycle of a tarball write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Writing,
    Committed,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Committed | UploadState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    /// Fail if the filename is committed by the time `done()` runs.
    Create,
    /// Explicit overwrite of a committed tarball.
    Replace,
}

/// Attachment metadata recorded by finished uploads, waiting to be folded
/// into the owning manifest.
#[derive(Debug, Default)]
struct StagingArea {
    entries: Mutex<HashMap<(String, String), Attachment>>,
}

impl StagingArea {
    fn record(&self, package: &str, filename: &str, attachment: Attachment) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((package.to_string(), filename.to_string()), attachment);
        }
    }

    fn peek(&self, package: &str, filename: &str) -> Option<Attachment> {
        self.entries
            .lock()
            .ok()?
            .get(&(package.to_string(), filename.to_string()))
            .cloned()
    }

    fn take(&self, package: &str, filename: &str) -> Option<Attachment> {
        self.entries
            .lock()
            .ok()?
            .remove(&(package.to_string(), filename.to_string()))
    }

    fn discard_package(&self, package: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(p, _), _| p != package);
        }
    }
}

/// Drop the temp name of an upload that is already linked into place. The
/// tarball is committed at this point, so a failure only leaves a stray temp
/// file behind.
async fn remove_linked_temp(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        warn!(path = %temp_path.display(), error = %e, "Failed to remove upload temp file after commit");
    }
}

/// Writable sink for one tarball.
pub struct UploadTarball {
    package: String,
    filename: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    digest: Option<StreamingDigest>,
    state: UploadState,
    mode: CommitMode,
    signal: AbortSignal,
    max_size: Option<u64>,
    fsync: bool,
    staging: Arc<StagingArea>,
}

impl UploadTarball {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.digest.as_ref().map_or(0, StreamingDigest::length)
    }

    fn ensure_writable(&self, op: &str) -> StorageResult<()> {
        if self.state.is_terminal() {
            return Err(StorageError::InvalidState(format!(
                "cannot {op} tarball {}: upload already {:?}",
                self.filename, self.state
            )));
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        self.file = None;
        self.digest = None;
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.temp_path.display(), error = %e, "Failed to remove partial tarball");
            }
        }
        self.state = UploadState::Aborted;
    }

    async fn fail_if_aborted(&mut self) -> StorageResult<()> {
        if self.signal.is_aborted() {
            self.rollback().await;
            info!(package = %self.package, filename = %self.filename, "Tarball upload cancelled");
            return Err(StorageError::Aborted(format!(
                "upload of {} cancelled",
                self.filename
            )));
        }
        Ok(())
    }

    /// Append one chunk. Returns once the chunk is handed to the file, so a
    /// slow disk slows the producer down.
    pub async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.ensure_writable("write")?;
        self.fail_if_aborted().await?;

        let written = self.bytes_written() + chunk.len() as u64;
        if let Some(max) = self.max_size {
            if written > max {
                self.rollback().await;
                return Err(StorageError::Validation(format!(
                    "tarball {} exceeds maximum size of {max} bytes",
                    self.filename
                )));
            }
        }

        let Some(file) = self.file.as_mut() else {
            return Err(StorageError::InvalidState(format!(
                "tarball {} has no open file",
                self.filename
            )));
        };
        if let Err(e) = file.write_all(chunk).await {
            self.rollback().await;
            return Err(StorageError::Io(e));
        }
        if let Some(digest) = self.digest.as_mut() {
            digest.update(chunk);
        }
        self.state = UploadState::Writing;
        Ok(())
    }

    /// Drain `source` into the tarball, one chunk at a time.
    pub async fn pipe_from<S, E>(&mut self, mut source: S) -> StorageResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<StorageError>,
    {
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(chunk) => self.write(&chunk).await?,
                Err(e) => {
                    self.rollback().await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Finalize the write and publish the tarball under its filename.
    pub async fn done(&mut self) -> StorageResult<Attachment> {
        self.ensure_writable("finish")?;
        self.fail_if_aborted().await?;

        let (Some(mut file), Some(digest)) = (self.file.take(), self.digest.take()) else {
            return Err(StorageError::InvalidState(format!(
                "tarball {} has no open file",
                self.filename
            )));
        };

        let flushed = async {
            file.flush().await?;
            if self.fsync {
                file.sync_all().await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;
        drop(file);
        if let Err(e) = flushed {
            self.rollback().await;
            return Err(StorageError::Io(e));
        }

        if let Err(e) = self.commit().await {
            self.rollback().await;
            return Err(e);
        }

        let digest = digest.finish();
        let attachment = Attachment {
            content_type: Some(TARBALL_CONTENT_TYPE.to_string()),
            data: None,
            length: Some(digest.length),
            shasum: Some(digest.shasum),
            integrity: Some(digest.integrity),
            version: None,
        };
        self.staging
            .record(&self.package, &self.filename, attachment.clone());
        self.state = UploadState::Committed;

        info!(
            package = %self.package,
            filename = %self.filename,
            size = digest.length,
            "Tarball committed"
        );
        Ok(attachment)
    }

    async fn commit(&self) -> StorageResult<()> {
        match self.mode {
            CommitMode::Replace => {
                fs::rename(&self.temp_path, &self.final_path).await?;
            }
            CommitMode::Create => {
                // A hard link publishes without clobbering a concurrent commit.
                match fs::hard_link(&self.temp_path, &self.final_path).await {
                    Ok(()) => remove_linked_temp(&self.temp_path).await,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(self.already_committed());
                    }
                    Err(e) => {
                        debug!(error = %e, "Hard link unavailable, falling back to rename");
                        if fs::try_exists(&self.final_path).await? {
                            return Err(self.already_committed());
                        }
                        fs::rename(&self.temp_path, &self.final_path).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn already_committed(&self) -> StorageError {
        StorageError::Conflict(format!(
            "tarball {} of {} is already committed",
            self.filename, self.package
        ))
    }

    /// Discard everything written so far. No artifact remains once this returns.
    pub async fn abort(&mut self) -> StorageResult<()> {
        match self.state {
            UploadState::Committed => Err(StorageError::InvalidState(format!(
                "cannot abort tarball {}: already committed",
                self.filename
            ))),
            UploadState::Aborted => Ok(()),
            UploadState::Open | UploadState::Writing => {
                self.rollback().await;
                debug!(package = %self.package, filename = %self.filename, "Tarball upload aborted");
                Ok(())
            }
        }
    }
}

impl Drop for UploadTarball {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.file = None;
            let _ = std::fs::remove_file(&self.temp_path);
            debug!(filename = %self.filename, "Unfinished tarball upload dropped");
        }
    }
}

/// Readable source for one committed tarball.
pub struct ReadTarball {
    filename: String,
    content_length: u64,
    inner: Option<BoxStream<'static, StorageResult<Bytes>>>,
    signal: AbortSignal,
}

impl ReadTarball {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Stop reading and release the file handle without draining it.
    pub fn abort(&mut self) {
        if self.inner.take().is_some() {
            debug!(filename = %self.filename, "Tarball read aborted");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_none()
    }

    /// Collect the remaining content.
    pub async fn into_bytes(mut self) -> StorageResult<Bytes> {
        let mut content = Vec::with_capacity(self.content_length as usize);
        while let Some(chunk) = self.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(content))
    }
}

impl Stream for ReadTarball {
    type Item = StorageResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.inner.is_some() && this.signal.is_aborted() {
            this.inner = None;
            return Poll::Ready(Some(Err(StorageError::Aborted(format!(
                "read of {} cancelled",
                this.filename
            )))));
        }
        match this.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Filesystem tarball store rooted at the registry storage directory.
///
/// Tarballs live next to their manifest in `<root>/<package>/<filename>`.
#[derive(Clone)]
pub struct TarballManager {
    root: PathBuf,
    chunk_size: usize,
    max_size: Option<u64>,
    fsync: bool,
    staging: Arc<StagingArea>,
}

impl TarballManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_size: None,
            fsync: true,
            staging: Arc::new(StagingArea::default()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    fn file_path(&self, package: &str, filename: &str) -> StorageResult<PathBuf> {
        validate_package_name(package)?;
        validate_filename(filename)?;
        Ok(self.package_dir(package).join(filename))
    }

    /// Open a write for a filename that is not committed yet.
    pub async fn add_tarball(
        &self,
        package: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.open_upload(package, filename, signal, CommitMode::Create)
            .await
    }

    /// Open a write that overwrites a committed tarball on `done()`.
    pub async fn replace_tarball(
        &self,
        package: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.open_upload(package, filename, signal, CommitMode::Replace)
            .await
    }

    async fn open_upload(
        &self,
        package: &str,
        filename: &str,
        signal: AbortSignal,
        mode: CommitMode,
    ) -> StorageResult<UploadTarball> {
        let final_path = self.file_path(package, filename)?;
        if signal.is_aborted() {
            return Err(StorageError::Aborted(format!(
                "upload of {filename} cancelled before it started"
            )));
        }
        if mode == CommitMode::Create && fs::try_exists(&final_path).await? {
            return Err(StorageError::Conflict(format!(
                "tarball {filename} of {package} is already committed"
            )));
        }

        fs::create_dir_all(self.package_dir(package)).await?;
        let temp_path = temp_path_for(&final_path);
        let file = fs::File::create(&temp_path).await?;
        debug!(package = %package, filename = %filename, ?mode, "Tarball upload opened");

        Ok(UploadTarball {
            package: package.to_string(),
            filename: filename.to_string(),
            temp_path,
            final_path,
            file: Some(file),
            digest: Some(StreamingDigest::new()),
            state: UploadState::Open,
            mode,
            signal,
            max_size: self.max_size,
            fsync: self.fsync,
            staging: self.staging.clone(),
        })
    }

    /// Open a committed tarball for streaming.
    pub async fn get_tarball(
        &self,
        package: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<ReadTarball> {
        let path = self.file_path(package, filename)?;
        if signal.is_aborted() {
            return Err(StorageError::Aborted(format!(
                "read of {filename} cancelled before it started"
            )));
        }
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::not_found_io(e, format!("{package}/{filename}")))?;
        let content_length = file.metadata().await?.len();
        let chunk_size = self.chunk_size;

        let inner = futures_util::stream::try_unfold(file, move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await.map_err(StorageError::Io)?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), file)))
        })
        .boxed();

        debug!(package = %package, filename = %filename, size = content_length, "Tarball read opened");
        Ok(ReadTarball {
            filename: filename.to_string(),
            content_length,
            inner: Some(inner),
            signal,
        })
    }

    /// Whether `filename` is committed for `package`. In-flight writes are
    /// never visible here.
    pub async fn has_file(&self, package: &str, filename: &str) -> StorageResult<bool> {
        let path = self.file_path(package, filename)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Committed tarball filenames of `package`.
    pub async fn list_files(&self, package: &str) -> StorageResult<Vec<String>> {
        let dir = self.package_dir(package);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_file()
                && !name.starts_with(TEMP_PREFIX)
                && name != crate::backend::MANIFEST_FILE
            {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Delete a committed tarball. Revision checks are the caller's job.
    pub(crate) async fn delete_file(&self, package: &str, filename: &str) -> StorageResult<()> {
        let path = self.file_path(package, filename)?;
        crate::storage::remove_file(&path, &format!("{package}/{filename}")).await?;
        info!(package = %package, filename = %filename, "Tarball removed");
        Ok(())
    }

    /// Attachment metadata recorded by the last `done()` for this file.
    pub(crate) fn staged(&self, package: &str, filename: &str) -> Option<Attachment> {
        self.staging.peek(package, filename)
    }

    pub(crate) fn take_staged(&self, package: &str, filename: &str) -> Option<Attachment> {
        self.staging.take(package, filename)
    }

    pub(crate) fn discard_staged(&self, package: &str) {
        self.staging.discard_package(package);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TarballManager {
        TarballManager::new(dir.path()).with_chunk_size(4)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);

        let mut upload = tarballs
            .add_tarball("foo", "foo-1.0.0.tgz", AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(upload.state(), UploadState::Open);
        upload.write(b"hello ").await.unwrap();
        assert_eq!(upload.state(), UploadState::Writing);
        assert!(!tarballs.has_file("foo", "foo-1.0.0.tgz").await.unwrap());
        upload.write(b"world").await.unwrap();
        let attachment = upload.done().await.unwrap();

        assert_eq!(upload.state(), UploadState::Committed);
        assert_eq!(attachment.length, Some(11));
        assert_eq!(
            attachment.shasum.as_deref(),
            Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
        assert!(tarballs.has_file("foo", "foo-1.0.0.tgz").await.unwrap());

        let read = tarballs
            .get_tarball("foo", "foo-1.0.0.tgz", AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(read.content_length(), 11);
        assert_eq!(read.into_bytes().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_linked_temp_cleanup_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        // remove_file cannot delete a directory.
        let stuck = dir.path().join(".tmp.stuck");
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("inner"), b"x").unwrap();

        remove_linked_temp(&stuck).await;
        assert!(stuck.exists());

        let gone = dir.path().join(".tmp.gone");
        std::fs::write(&gone, b"x").unwrap();
        remove_linked_temp(&gone).await;
        assert!(!gone.exists());
    }

    #[tokio::test]
    async fn test_abort_leaves_no_artifact() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);

        let mut upload = tarballs
            .add_tarball("foo", "foo-1.0.0.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.write(b"partial").await.unwrap();
        upload.abort().await.unwrap();

        assert_eq!(upload.state(), UploadState::Aborted);
        assert!(!tarballs.has_file("foo", "foo-1.0.0.tgz").await.unwrap());
        assert!(tarballs.list_files("foo").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("foo")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_states_reject_operations() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);

        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.done().await.unwrap();
        assert!(matches!(upload.done().await, Err(StorageError::InvalidState(_))));
        assert!(matches!(upload.write(b"x").await, Err(StorageError::InvalidState(_))));
        assert!(matches!(upload.abort().await, Err(StorageError::InvalidState(_))));

        let mut upload = tarballs
            .add_tarball("foo", "b.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.abort().await.unwrap();
        assert!(matches!(upload.done().await, Err(StorageError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_add_on_committed_requires_replace() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);

        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.write(b"v1").await.unwrap();
        upload.done().await.unwrap();

        assert!(matches!(
            tarballs.add_tarball("foo", "a.tgz", AbortSignal::never()).await,
            Err(StorageError::Conflict(_))
        ));

        let mut replace = tarballs
            .replace_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        replace.write(b"v2").await.unwrap();
        replace.done().await.unwrap();
        let read = tarballs
            .get_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(read.into_bytes().await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_racing_commits_of_same_filename() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);

        let mut first = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        let mut second = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        first.write(b"first").await.unwrap();
        second.write(b"second").await.unwrap();
        first.done().await.unwrap();
        assert!(matches!(second.done().await, Err(StorageError::Conflict(_))));
        assert_eq!(second.state(), UploadState::Aborted);
        assert_eq!(tarballs.list_files("foo").await.unwrap(), vec!["a.tgz"]);
    }

    #[tokio::test]
    async fn test_abort_signal_cancels_write() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        let controller = AbortController::new();

        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", controller.signal())
            .await
            .unwrap();
        upload.write(b"abc").await.unwrap();
        controller.abort();
        assert!(matches!(upload.write(b"def").await, Err(StorageError::Aborted(_))));
        assert_eq!(upload.state(), UploadState::Aborted);
        assert!(!tarballs.has_file("foo", "a.tgz").await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path().join("foo")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_upload_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        {
            let mut upload = tarballs
                .add_tarball("foo", "a.tgz", AbortSignal::never())
                .await
                .unwrap();
            upload.write(b"abc").await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path().join("foo")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_read_abort_mid_stream() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.write(b"0123456789abcdef").await.unwrap();
        upload.done().await.unwrap();

        let mut read = tarballs
            .get_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        let first = read.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"0123"));
        read.abort();
        assert!(read.is_aborted());
        assert!(read.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_abort_signal_mid_stream() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.write(b"0123456789").await.unwrap();
        upload.done().await.unwrap();

        let controller = AbortController::new();
        let mut read = tarballs
            .get_tarball("foo", "a.tgz", controller.signal())
            .await
            .unwrap();
        read.next().await.unwrap().unwrap();
        controller.abort();
        assert!(matches!(read.next().await, Some(Err(StorageError::Aborted(_)))));
        assert!(read.next().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_tarball_is_not_found() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        assert!(matches!(
            tarballs
                .get_tarball("foo", "nope.tgz", AbortSignal::never())
                .await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_size_rolls_back() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir).with_max_size(Some(4));
        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload.write(b"abc").await.unwrap();
        assert!(matches!(upload.write(b"de").await, Err(StorageError::Validation(_))));
        assert_eq!(upload.state(), UploadState::Aborted);
        assert!(!tarballs.has_file("foo", "a.tgz").await.unwrap());
    }

    #[tokio::test]
    async fn test_pipe_from_stream() {
        let dir = TempDir::new().unwrap();
        let tarballs = manager(&dir);
        let chunks = vec![
            Ok::<_, StorageError>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ];
        let mut upload = tarballs
            .add_tarball("foo", "a.tgz", AbortSignal::never())
            .await
            .unwrap();
        upload
            .pipe_from(futures_util::stream::iter(chunks))
            .await
            .unwrap();
        assert_eq!(upload.bytes_written(), 4);
        upload.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_signal_future() {
        let controller = AbortController::new();
        let mut signal = controller.signal();
        assert!(!signal.is_aborted());
        controller.abort();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.aborted())
            .await
            .expect("signal should resolve after abort");
        assert!(AbortSignal::never().rx.has_changed().is_err());
    }
}
