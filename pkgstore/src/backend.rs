//! # Per-Package Backend Handle
//!
//! [`PackageStorage`] owns one package directory: `<root>/<name>/package.json`
//! plus the tarballs next to it. Manifest writes are compare-and-swap on
//! `_rev` under a per-package lock, so writers on the same package are
//! linearized while writers on different packages never share a lock. Reads
//! take no lock; the atomic rename guarantees they see a whole document.

use crate::error::{StorageError, StorageResult};
use crate::manifest::{Manifest, Revision};
use crate::storage::{read_file_optional, remove_dir_all, save_file_atomic};
use crate::tarball::{AbortSignal, ReadTarball, TarballManager, UploadTarball};
use crate::validation::validate_package_name;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Manifest file name inside each package directory.
pub const MANIFEST_FILE: &str = "package.json";

/// One async lock per package name.
#[derive(Debug, Default)]
pub struct PackageLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackageLocks {
    fn lock_for(&self, name: &str) -> StorageResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StorageError::InvalidState("package lock table poisoned".to_string()))?;
        // Entries nobody else holds are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(name.to_string()).or_default().clone())
    }
}

/// What the stored manifest must look like for a write to go through.
#[derive(Debug, Clone, Copy)]
pub enum Precondition<'a> {
    /// No manifest is stored yet.
    Absent,
    /// The stored manifest carries exactly this revision.
    Revision(&'a Revision),
}

impl Precondition<'_> {
    fn describe(&self) -> String {
        match self {
            Precondition::Absent => "<absent>".to_string(),
            Precondition::Revision(rev) => rev.to_string(),
        }
    }
}

/// Storage handle for one package.
#[derive(Clone)]
pub struct PackageStorage {
    name: String,
    dir: PathBuf,
    tarballs: TarballManager,
    locks: Arc<PackageLocks>,
    fsync: bool,
}

impl PackageStorage {
    pub(crate) fn new(
        name: &str,
        tarballs: TarballManager,
        locks: Arc<PackageLocks>,
        fsync: bool,
    ) -> StorageResult<Self> {
        validate_package_name(name)?;
        Ok(Self {
            name: name.to_string(),
            dir: tarballs.package_dir(name),
            tarballs,
            locks,
            fsync,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub async fn read_package_optional(&self) -> StorageResult<Option<Manifest>> {
        match read_file_optional(self.manifest_path()).await? {
            Some(bytes) => Ok(Some(Manifest::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn read_package(&self) -> StorageResult<Manifest> {
        self.read_package_optional()
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("package {}", self.name)))
    }

    fn check(&self, stored: Option<&Manifest>, expect: Precondition<'_>) -> StorageResult<()> {
        let holds = match (expect, stored) {
            (Precondition::Absent, None) => true,
            (Precondition::Revision(rev), Some(current)) => &current.rev == rev,
            _ => false,
        };
        if holds {
            return Ok(());
        }
        Err(StorageError::RevisionMismatch {
            expected: expect.describe(),
            actual: stored.map_or_else(|| "<absent>".to_string(), |m| m.rev.to_string()),
        })
    }

    /// Persist `manifest` with a fresh revision if the stored state still
    /// matches `expect`.
    pub async fn save_package(
        &self,
        mut manifest: Manifest,
        expect: Precondition<'_>,
    ) -> StorageResult<Manifest> {
        let lock = self.locks.lock_for(&self.name)?;
        let _guard = lock.lock().await;

        let stored = self.read_package_optional().await?;
        self.check(stored.as_ref(), expect)?;

        manifest.rev = stored.map(|m| m.rev).unwrap_or_default().next();
        manifest.id.get_or_insert_with(|| self.name.clone());
        save_file_atomic(self.manifest_path(), manifest.to_json()?, self.fsync).await?;

        debug!(package = %self.name, rev = %manifest.rev, "Manifest saved");
        Ok(manifest)
    }

    /// Store the first manifest of this package.
    pub async fn create_package(&self, manifest: Manifest) -> StorageResult<Manifest> {
        match self.save_package(manifest, Precondition::Absent).await {
            Err(StorageError::RevisionMismatch { .. }) => Err(StorageError::Conflict(format!(
                "package {} already exists",
                self.name
            ))),
            other => other,
        }
    }

    /// One read-modify-write cycle gated on the revision that was read.
    pub async fn update_package<F>(&self, handler: F) -> StorageResult<Manifest>
    where
        F: FnOnce(Manifest) -> StorageResult<Manifest>,
    {
        let current = self.read_package().await?;
        let expected = current.rev.clone();
        let updated = handler(current)?;
        self.save_package(updated, Precondition::Revision(&expected))
            .await
    }

    /// Delete one tarball of this package.
    pub async fn delete_package(&self, filename: &str) -> StorageResult<()> {
        self.tarballs.delete_file(&self.name, filename).await
    }

    /// Delete a tarball only while the manifest is still at `expect`.
    pub(crate) async fn delete_tarball_if(
        &self,
        filename: &str,
        expect: Precondition<'_>,
    ) -> StorageResult<()> {
        let lock = self.locks.lock_for(&self.name)?;
        let _guard = lock.lock().await;
        let stored = self.read_package_optional().await?;
        self.check(stored.as_ref(), expect)?;
        self.delete_package(filename).await?;
        self.tarballs.take_staged(&self.name, filename);
        Ok(())
    }

    /// Remove the package directory with its manifest and every tarball.
    pub async fn remove_package(&self) -> StorageResult<()> {
        self.remove_package_if(None).await
    }

    pub(crate) async fn remove_package_if(
        &self,
        expect: Option<Precondition<'_>>,
    ) -> StorageResult<()> {
        let lock = self.locks.lock_for(&self.name)?;
        let _guard = lock.lock().await;
        let stored = self.read_package_optional().await?;
        match expect {
            Some(expect) => self.check(stored.as_ref(), expect)?,
            None if stored.is_none() => {
                return Err(StorageError::NotFound(format!("package {}", self.name)))
            }
            None => {}
        }
        remove_dir_all(&self.dir).await?;
        self.tarballs.discard_staged(&self.name);
        info!(package = %self.name, "Package removed");
        Ok(())
    }

    pub async fn write_tarball(
        &self,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.tarballs.add_tarball(&self.name, filename, signal).await
    }

    pub async fn read_tarball(
        &self,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<ReadTarball> {
        self.tarballs.get_tarball(&self.name, filename, signal).await
    }

    pub async fn has_file(&self, filename: &str) -> StorageResult<bool> {
        self.tarballs.has_file(&self.name, filename).await
    }

    pub(crate) async fn local_files(&self) -> StorageResult<Vec<String>> {
        self.tarballs.list_files(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Version;
    use tempfile::TempDir;

    fn handle(dir: &TempDir, name: &str) -> PackageStorage {
        PackageStorage::new(
            name,
            TarballManager::new(dir.path()),
            Arc::new(PackageLocks::default()),
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let locks = PackageLocks::default();
        let held = locks.lock_for("foo").unwrap();
        for i in 0..10 {
            drop(locks.lock_for(&format!("pkg-{i}")).unwrap());
        }
        let _bar = locks.lock_for("bar").unwrap();

        let table = locks.locks.lock().unwrap();
        assert_eq!(table.len(), 2);
        assert!(Arc::ptr_eq(&table["foo"], &held));
        assert!(table.contains_key("bar"));
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let dir = TempDir::new().unwrap();
        let storage = handle(&dir, "foo");
        assert!(matches!(
            storage.read_package().await,
            Err(StorageError::NotFound(_))
        ));

        let saved = storage.create_package(Manifest::new("foo")).await.unwrap();
        assert_eq!(saved.rev, "1");
        assert_eq!(storage.read_package().await.unwrap(), saved);
        assert!(dir.path().join("foo").join(MANIFEST_FILE).exists());

        assert!(matches!(
            storage.create_package(Manifest::new("foo")).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = handle(&dir, "foo");
        let first = storage.create_package(Manifest::new("foo")).await.unwrap();

        let second = storage
            .save_package(first.clone(), Precondition::Revision(&first.rev))
            .await
            .unwrap();
        assert_eq!(second.rev, "2");

        let err = storage
            .save_package(first.clone(), Precondition::Revision(&first.rev))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::RevisionMismatch { ref expected, ref actual } if expected == "1" && actual == "2"
        ));
        assert_eq!(storage.read_package().await.unwrap().rev, "2");
    }

    #[tokio::test]
    async fn test_update_package_applies_handler() {
        let dir = TempDir::new().unwrap();
        let storage = handle(&dir, "foo");
        storage.create_package(Manifest::new("foo")).await.unwrap();

        let updated = storage
            .update_package(|mut m| {
                m.versions.insert(
                    "1.0.0".to_string(),
                    Version::new("foo", "1.0.0", "foo-1.0.0.tgz"),
                );
                Ok(m)
            })
            .await
            .unwrap();
        assert_eq!(updated.rev, "2");
        assert!(updated.versions.contains_key("1.0.0"));

        let failed = storage
            .update_package(|_| Err(StorageError::Validation("nope".to_string())))
            .await;
        assert!(failed.is_err());
        assert_eq!(storage.read_package().await.unwrap().rev, "2");
    }

    #[tokio::test]
    async fn test_remove_package() {
        let dir = TempDir::new().unwrap();
        let storage = handle(&dir, "@scope/foo");
        assert!(matches!(
            storage.remove_package().await,
            Err(StorageError::NotFound(_))
        ));
        storage
            .create_package(Manifest::new("@scope/foo"))
            .await
            .unwrap();
        storage.remove_package().await.unwrap();
        assert!(!dir.path().join("@scope/foo").exists());
    }

    #[test]
    fn test_rejects_invalid_name() {
        let dir = TempDir::new().unwrap();
        assert!(PackageStorage::new(
            "../escape",
            TarballManager::new(dir.path()),
            Arc::new(PackageLocks::default()),
            false
        )
        .is_err());
    }
}
