//! # Package Metadata Store
//!
//! Manifest CRUD, version and tag mutation, and optimistic concurrency over
//! the filesystem backend.
//!
//! ## Mutation cycle
//!
//! Every mutation is a read-modify-write cycle:
//!
//! 1. read the manifest and remember its `_rev`
//! 2. apply the change to a copy, then reconcile tarball ownership and
//!    validate the result
//! 3. compare-and-swap: commit only if the stored `_rev` is unchanged
//!
//! A writer that loses the race re-reads and tries again, up to
//! `max_update_attempts` times with a short randomized backoff. Exhausting
//! the budget surfaces [`StorageError::Conflict`]. Errors raised by the change
//! itself (`VersionConflict`, `Validation`, `NotFound`) are never retried.

use crate::backend::{PackageLocks, PackageStorage, Precondition};
use crate::config::RegistryConfig;
use crate::error::{StorageError, StorageResult};
use crate::local_data::RegistryDb;
use crate::manifest::{Manifest, Revision, Version, TIME_CREATED, TIME_MODIFIED};
use crate::plugin::MetadataFilter;
use crate::tarball::{AbortSignal, ReadTarball, TarballManager, UploadTarball};
use crate::uplink::merge_remote;
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of read-modify-write attempts per mutation.
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 5;

const BACKOFF_MIN_MS: u64 = 1;
const BACKOFF_MAX_MS: u64 = 10;

/// How a mutation treats package existence.
#[derive(Debug, Clone, Copy, Default)]
struct MutateOptions {
    /// Start from an empty manifest when none is stored.
    create_if_missing: bool,
    /// Delete the package once its last version is gone.
    remove_when_empty: bool,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Manifest store for all packages under one storage root.
pub struct PackageMetadataStore {
    root: PathBuf,
    tarballs: TarballManager,
    locks: Arc<PackageLocks>,
    db: RegistryDb,
    filters: Vec<Arc<dyn MetadataFilter>>,
    max_attempts: u32,
    fsync: bool,
    closed: AtomicBool,
}

impl PackageMetadataStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            tarballs: TarballManager::new(&root),
            locks: Arc::new(PackageLocks::default()),
            db: RegistryDb::new(&root, true),
            filters: Vec::new(),
            max_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
            fsync: true,
            closed: AtomicBool::new(false),
            root,
        }
    }

    /// Store configured from the `storage`, `store` and `max_body_size`
    /// settings.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let store = &config.store;
        let mut this = Self::new(&config.storage)
            .with_max_attempts(store.max_update_attempts)
            .with_fsync(store.fsync);
        this.tarballs = this
            .tarballs
            .with_chunk_size(store.chunk_size)
            .with_max_size(Some(config.max_body_size));
        this
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self.tarballs = self.tarballs.with_fsync(fsync);
        self.db = RegistryDb::new(&self.root, fsync);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tarballs(&self) -> &TarballManager {
        &self.tarballs
    }

    pub fn registry_db(&self) -> &RegistryDb {
        &self.db
    }

    /// Storage handle for one package.
    pub fn package(&self, name: &str) -> StorageResult<PackageStorage> {
        PackageStorage::new(name, self.tarballs.clone(), self.locks.clone(), self.fsync)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::InvalidState(
                "storage has been closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Current manifest of `name`, passed through the registered filters.
    pub async fn get(&self, name: &str) -> StorageResult<Manifest> {
        let mut manifest = self.package(name)?.read_package().await?;
        for filter in &self.filters {
            manifest = filter.filter_metadata(manifest).await?;
        }
        Ok(manifest)
    }

    /// Store the first manifest of `name`.
    pub async fn create(&self, name: &str, mut initial: Manifest) -> StorageResult<Manifest> {
        self.ensure_open()?;
        if initial.name != name {
            return Err(StorageError::Validation(format!(
                "manifest name {} does not match package {name}",
                initial.name
            )));
        }
        let storage = self.package(name)?;
        let local = storage.local_files().await?;
        initial.reconcile_tarballs(|f| local.iter().any(|l| l == f));
        initial.validate_committed()?;
        initial.time.entry(TIME_CREATED.to_string()).or_insert_with(now_iso);

        let created = storage.create_package(initial).await?;
        self.record_listed(name, true).await;
        info!(package = %name, rev = %created.rev, "Package created");
        Ok(created)
    }

    /// Publish `version`, creating the package on first publish.
    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Version,
        tag: Option<&str>,
    ) -> StorageResult<Manifest> {
        self.ensure_open()?;
        let filename = metadata.tarball_filename().map(str::to_string);
        let staged = filename
            .as_deref()
            .and_then(|f| self.tarballs.staged(name, f));

        let options = MutateOptions {
            create_if_missing: true,
            ..MutateOptions::default()
        };
        let saved = self
            .mutate(name, options, |manifest| {
                if manifest.versions.contains_key(version) {
                    return Err(StorageError::VersionConflict {
                        package: name.to_string(),
                        version: version.to_string(),
                    });
                }
                let mut metadata = metadata.clone();
                if let (Some(filename), Some(staged)) = (filename.as_deref(), staged.as_ref()) {
                    let mut attachment = staged.clone();
                    let digest = attachment.shasum.clone().unwrap_or_default();
                    if metadata.dist.shasum.is_empty() {
                        metadata.dist.shasum = digest;
                    } else if !digest.is_empty() && metadata.dist.shasum != digest {
                        return Err(StorageError::Validation(format!(
                            "tarball {filename} has shasum {digest}, version {version} declares {}",
                            metadata.dist.shasum
                        )));
                    }
                    if metadata.dist.integrity.is_none() {
                        metadata.dist.integrity = attachment.integrity.clone();
                    }
                    attachment.version = Some(version.to_string());
                    manifest.attachments.insert(filename.to_string(), attachment);
                }

                manifest.versions.insert(version.to_string(), metadata);
                if let Some(tag) = tag {
                    manifest.dist_tags.insert(tag.to_string(), version.to_string());
                }
                let now = now_iso();
                manifest
                    .time
                    .entry(TIME_CREATED.to_string())
                    .or_insert_with(|| now.clone());
                manifest.time.insert(TIME_MODIFIED.to_string(), now.clone());
                manifest.time.insert(version.to_string(), now);
                Ok(())
            })
            .await?;

        if let Some(filename) = filename.as_deref() {
            self.tarballs.take_staged(name, filename);
        }
        self.record_listed(name, true).await;
        info!(package = %name, version = %version, rev = %saved.rev, "Version published");
        Ok(saved)
    }

    /// Set every tag in `tags`, or none of them.
    pub async fn merge_tags(
        &self,
        name: &str,
        tags: &IndexMap<String, String>,
    ) -> StorageResult<Manifest> {
        self.ensure_open()?;
        let saved = self
            .mutate(name, MutateOptions::default(), |manifest| {
                manifest.validate_tags(tags)?;
                for (tag, version) in tags {
                    manifest.dist_tags.insert(tag.clone(), version.clone());
                }
                Ok(())
            })
            .await?;
        debug!(package = %name, tags = tags.len(), rev = %saved.rev, "Tags merged");
        Ok(saved)
    }

    /// Remove `version` and the tags pointing at it. Removing the last
    /// version removes the whole package; the returned manifest then carries
    /// no versions and is no longer stored.
    pub async fn unpublish_version(&self, name: &str, version: &str) -> StorageResult<Manifest> {
        self.ensure_open()?;
        let mut orphaned: Option<String> = None;
        let options = MutateOptions {
            remove_when_empty: true,
            ..MutateOptions::default()
        };
        let saved = self
            .mutate(name, options, |manifest| {
                let Some(removed) = manifest.versions.shift_remove(version) else {
                    return Err(StorageError::NotFound(format!("version {version} of {name}")));
                };
                manifest.dist_tags.retain(|_, v| v != version);
                manifest.time.shift_remove(version);
                manifest.time.insert(TIME_MODIFIED.to_string(), now_iso());

                orphaned = removed
                    .tarball_filename()
                    .filter(|f| {
                        !manifest
                            .referenced_tarballs()
                            .any(|(other, _)| other == *f)
                    })
                    .map(str::to_string);
                if let Some(filename) = orphaned.as_deref() {
                    manifest.attachments.remove(filename);
                    manifest.distfiles.remove(filename);
                }
                Ok(())
            })
            .await?;

        if saved.versions.is_empty() {
            self.record_listed(name, false).await;
            info!(package = %name, version = %version, "Last version unpublished, package removed");
            return Ok(saved);
        }
        if let Some(filename) = orphaned.as_deref() {
            match self.tarballs.delete_file(name, filename).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!(package = %name, filename = %filename, error = %e, "Failed to remove unpublished tarball"),
            }
        }
        info!(package = %name, version = %version, rev = %saved.rev, "Version unpublished");
        Ok(saved)
    }

    /// Replace the stored manifest if it is still at `expected_rev`.
    /// Published versions cannot be modified through this call.
    pub async fn change_package(
        &self,
        name: &str,
        mut metadata: Manifest,
        expected_rev: &Revision,
    ) -> StorageResult<Manifest> {
        self.ensure_open()?;
        if metadata.name != name {
            return Err(StorageError::Validation(format!(
                "manifest name {} does not match package {name}",
                metadata.name
            )));
        }
        let storage = self.package(name)?;
        let current = storage.read_package().await?;
        if &current.rev != expected_rev {
            return Err(StorageError::RevisionMismatch {
                expected: expected_rev.to_string(),
                actual: current.rev.to_string(),
            });
        }
        for (key, version) in &metadata.versions {
            if let Some(existing) = current.versions.get(key) {
                if existing != version {
                    return Err(StorageError::Validation(format!(
                        "published version {key} of {name} cannot be modified"
                    )));
                }
            }
        }

        let local = storage.local_files().await?;
        metadata.reconcile_tarballs(|f| local.iter().any(|l| l == f));
        metadata.validate_committed()?;
        let saved = storage
            .save_package(metadata, Precondition::Revision(expected_rev))
            .await?;
        debug!(package = %name, rev = %saved.rev, "Package changed");
        Ok(saved)
    }

    /// Delete the manifest and every tarball of `name`.
    pub async fn remove_package(&self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.package(name)?.remove_package().await?;
        self.record_listed(name, false).await;
        Ok(())
    }

    /// Delete a tarball only while the manifest is still at `expected_rev`.
    pub async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        expected_rev: &Revision,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        self.package(name)?
            .delete_tarball_if(filename, Precondition::Revision(expected_rev))
            .await
    }

    pub async fn star(&self, name: &str, user: &str) -> StorageResult<Manifest> {
        self.ensure_open()?;
        self.mutate(name, MutateOptions::default(), |manifest| {
            manifest.users.insert(user.to_string(), true);
            Ok(())
        })
        .await
    }

    pub async fn unstar(&self, name: &str, user: &str) -> StorageResult<Manifest> {
        self.ensure_open()?;
        self.mutate(name, MutateOptions::default(), |manifest| {
            manifest.users.remove(user);
            Ok(())
        })
        .await
    }

    /// Record a fetch from `uplink` and fold its metadata into `name`.
    pub async fn update_from_uplink(
        &self,
        name: &str,
        uplink: &str,
        etag: &str,
        remote: &Manifest,
    ) -> StorageResult<Manifest> {
        self.ensure_open()?;
        let options = MutateOptions {
            create_if_missing: true,
            ..MutateOptions::default()
        };
        let saved = self
            .mutate(name, options, |manifest| {
                let mut merged = merge_remote(manifest, remote, uplink);
                merged.uplinks.record_fetch(uplink, etag, Utc::now());
                *manifest = merged;
                Ok(())
            })
            .await?;
        debug!(package = %name, uplink = %uplink, rev = %saved.rev, "Uplink metadata merged");
        Ok(saved)
    }

    pub async fn add_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.ensure_open()?;
        self.tarballs.add_tarball(name, filename, signal).await
    }

    pub async fn replace_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.ensure_open()?;
        self.tarballs.replace_tarball(name, filename, signal).await
    }

    pub async fn get_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<ReadTarball> {
        self.tarballs.get_tarball(name, filename, signal).await
    }

    pub async fn has_file(&self, name: &str, filename: &str) -> StorageResult<bool> {
        self.tarballs.has_file(name, filename).await
    }

    /// Bring the local package list in line with a committed manifest change.
    /// The manifest is authoritative, so a failed list update is only logged;
    /// the next publish of the package adds it again.
    async fn record_listed(&self, name: &str, listed: bool) {
        let result = if listed {
            self.db.add(name).await
        } else {
            self.db.remove(name).await
        };
        if let Err(e) = result {
            warn!(package = %name, listed, error = %e, "Failed to update local package list");
        }
    }

    /// Bounded read-modify-write loop around `change`.
    async fn mutate<F>(
        &self,
        name: &str,
        options: MutateOptions,
        mut change: F,
    ) -> StorageResult<Manifest>
    where
        F: FnMut(&mut Manifest) -> StorageResult<()>,
    {
        let storage = self.package(name)?;

        for attempt in 1..=self.max_attempts {
            let stored = storage.read_package_optional().await?;
            let existed = stored.is_some();
            let current = match stored {
                Some(manifest) => manifest,
                None if options.create_if_missing => Manifest::new(name),
                None => return Err(StorageError::NotFound(format!("package {name}"))),
            };
            let expect = if existed {
                Precondition::Revision(&current.rev)
            } else {
                Precondition::Absent
            };

            let mut next = current.clone();
            change(&mut next)?;

            let outcome = if options.remove_when_empty && existed && next.versions.is_empty() {
                storage.remove_package_if(Some(expect)).await.map(|()| {
                    next.rev = current.rev.next();
                    next
                })
            } else {
                let local = storage.local_files().await?;
                next.reconcile_tarballs(|f| local.iter().any(|l| l == f));
                next.validate_committed()?;
                storage.save_package(next, expect).await
            };

            match outcome {
                Err(StorageError::RevisionMismatch { expected, actual }) => {
                    debug!(
                        package = %name,
                        attempt,
                        expected = %expected,
                        actual = %actual,
                        "Manifest changed underneath, retrying"
                    );
                    let delay = rand::rng().random_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }

        warn!(package = %name, attempts = self.max_attempts, "Manifest update contention exhausted");
        Err(StorageError::Conflict(format!(
            "package {name} changed concurrently {} times, giving up",
            self.max_attempts
        )))
    }
}
