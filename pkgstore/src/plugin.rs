//! # Plugin Contract
//!
//! The seams a registry uses to swap backends without touching callers.
//!
//! ```text
//! Plugin (version, close)
//!     ├── StoragePlugin   manifests, tarballs, tokens
//!     ├── MetadataFilter  rewrites manifests on read
//!     └── AuthPlugin      see crate::auth
//! ```
//!
//! Every storage operation has exactly one implementation: the async,
//! result-returning method on [`StoragePlugin`]. Callers still written against
//! completion callbacks go through [`LegacyStorage`], a thin adapter that runs
//! the canonical method and hands its outcome to the callback as
//! `(error, result)`. The two surfaces therefore cannot diverge.

use crate::config::RegistryConfig;
use crate::error::{StorageError, StorageResult};
use crate::manifest::{Manifest, Revision, Version};
use crate::tarball::{AbortSignal, ReadTarball, UploadTarball};
use crate::token::{Token, TokenFilter};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Span;

/// Shared construction context handed to every backend.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Global registry settings
    pub config: Arc<RegistryConfig>,
    /// Injected logger; backends record inside this span
    pub logger: Span,
}

impl PluginOptions {
    pub fn new(config: Arc<RegistryConfig>) -> Self {
        Self {
            config,
            logger: tracing::info_span!("plugin"),
        }
    }

    pub fn with_logger(mut self, logger: Span) -> Self {
        self.logger = logger;
        self
    }
}

/// Lifecycle shared by all backends.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn version(&self) -> &str;

    /// Release resources. Mutations after `close` fail with `InvalidState`.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Construction from `(config, {config, logger})`.
pub trait PluginFactory: Plugin + Sized {
    /// Backend-specific settings, validated when deserialized
    type Config: DeserializeOwned;

    fn new(config: Self::Config, options: PluginOptions) -> anyhow::Result<Self>;
}

/// Storage capabilities a backend must expose.
#[async_trait::async_trait]
pub trait StoragePlugin: Plugin {
    async fn get_package(&self, name: &str) -> StorageResult<Manifest>;

    async fn create_package(&self, name: &str, manifest: Manifest) -> StorageResult<Manifest>;

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Version,
        tag: Option<&str>,
    ) -> StorageResult<Manifest>;

    async fn merge_tags(
        &self,
        name: &str,
        tags: &IndexMap<String, String>,
    ) -> StorageResult<Manifest>;

    async fn unpublish_version(&self, name: &str, version: &str) -> StorageResult<Manifest>;

    async fn change_package(
        &self,
        name: &str,
        metadata: Manifest,
        expected_rev: &Revision,
    ) -> StorageResult<Manifest>;

    async fn remove_package(&self, name: &str) -> StorageResult<()>;

    async fn star(&self, name: &str, user: &str) -> StorageResult<Manifest>;

    async fn unstar(&self, name: &str, user: &str) -> StorageResult<Manifest>;

    async fn update_from_uplink(
        &self,
        name: &str,
        uplink: &str,
        etag: &str,
        remote: Manifest,
    ) -> StorageResult<Manifest>;

    async fn add_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball>;

    async fn replace_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball>;

    async fn get_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<ReadTarball>;

    async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        expected_rev: &Revision,
    ) -> StorageResult<()>;

    async fn has_file(&self, name: &str, filename: &str) -> StorageResult<bool>;

    async fn save_token(&self, token: Token) -> StorageResult<()>;

    async fn delete_token(&self, user: &str, key: &str) -> StorageResult<()>;

    async fn read_tokens(&self, filter: &TokenFilter) -> StorageResult<Vec<Token>>;

    /// Names of locally published packages.
    async fn local_packages(&self) -> StorageResult<Vec<String>>;

    async fn get_secret(&self) -> StorageResult<String>;

    async fn set_secret(&self, secret: &str) -> StorageResult<()>;
}

/// Rewrites manifests on their way out of storage.
#[async_trait::async_trait]
pub trait MetadataFilter: Plugin {
    async fn filter_metadata(&self, manifest: Manifest) -> StorageResult<Manifest>;
}

/// Completion callback of the legacy surface.
pub type Callback<T> = Box<dyn FnOnce(Option<StorageError>, Option<T>) + Send + 'static>;

/// Run `operation` and deliver its outcome to `callback`.
fn deliver<T, F>(operation: F, callback: Callback<T>) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = StorageResult<T>> + Send + 'static,
{
    tokio::spawn(async move {
        match operation.await {
            Ok(value) => callback(None, Some(value)),
            Err(err) => callback(Some(err), None),
        }
    })
}

/// Callback-delivered form of the storage operations.
///
/// Each method spawns the matching [`StoragePlugin`] call on the current
/// tokio runtime; the returned handle resolves once the callback has run.
pub trait LegacyStorage {
    fn read_package_cb(&self, name: String, callback: Callback<Manifest>) -> JoinHandle<()>;

    fn create_package_cb(
        &self,
        name: String,
        manifest: Manifest,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn add_version_cb(
        &self,
        name: String,
        version: String,
        metadata: Version,
        tag: Option<String>,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn merge_tags_cb(
        &self,
        name: String,
        tags: IndexMap<String, String>,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn unpublish_version_cb(
        &self,
        name: String,
        version: String,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn change_package_cb(
        &self,
        name: String,
        metadata: Manifest,
        expected_rev: Revision,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn remove_package_cb(&self, name: String, callback: Callback<()>) -> JoinHandle<()>;

    fn star_cb(&self, name: String, user: String, callback: Callback<Manifest>) -> JoinHandle<()>;

    fn unstar_cb(&self, name: String, user: String, callback: Callback<Manifest>)
        -> JoinHandle<()>;

    fn update_from_uplink_cb(
        &self,
        name: String,
        uplink: String,
        etag: String,
        remote: Manifest,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()>;

    fn remove_tarball_cb(
        &self,
        name: String,
        filename: String,
        expected_rev: Revision,
        callback: Callback<()>,
    ) -> JoinHandle<()>;

    fn save_token_cb(&self, token: Token, callback: Callback<()>) -> JoinHandle<()>;

    fn delete_token_cb(&self, user: String, key: String, callback: Callback<()>)
        -> JoinHandle<()>;

    fn read_tokens_cb(&self, filter: TokenFilter, callback: Callback<Vec<Token>>)
        -> JoinHandle<()>;
}

impl<P> LegacyStorage for Arc<P>
where
    P: StoragePlugin + ?Sized + 'static,
{
    fn read_package_cb(&self, name: String, callback: Callback<Manifest>) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.get_package(&name).await }, callback)
    }

    fn create_package_cb(
        &self,
        name: String,
        manifest: Manifest,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move { plugin.create_package(&name, manifest).await },
            callback,
        )
    }

    fn add_version_cb(
        &self,
        name: String,
        version: String,
        metadata: Version,
        tag: Option<String>,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move {
                plugin
                    .add_version(&name, &version, metadata, tag.as_deref())
                    .await
            },
            callback,
        )
    }

    fn merge_tags_cb(
        &self,
        name: String,
        tags: IndexMap<String, String>,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.merge_tags(&name, &tags).await }, callback)
    }

    fn unpublish_version_cb(
        &self,
        name: String,
        version: String,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move { plugin.unpublish_version(&name, &version).await },
            callback,
        )
    }

    fn change_package_cb(
        &self,
        name: String,
        metadata: Manifest,
        expected_rev: Revision,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move {
                plugin
                    .change_package(&name, metadata, &expected_rev)
                    .await
            },
            callback,
        )
    }

    fn remove_package_cb(&self, name: String, callback: Callback<()>) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.remove_package(&name).await }, callback)
    }

    fn star_cb(&self, name: String, user: String, callback: Callback<Manifest>) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.star(&name, &user).await }, callback)
    }

    fn unstar_cb(
        &self,
        name: String,
        user: String,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.unstar(&name, &user).await }, callback)
    }

    fn update_from_uplink_cb(
        &self,
        name: String,
        uplink: String,
        etag: String,
        remote: Manifest,
        callback: Callback<Manifest>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move {
                plugin
                    .update_from_uplink(&name, &uplink, &etag, remote)
                    .await
            },
            callback,
        )
    }

    fn remove_tarball_cb(
        &self,
        name: String,
        filename: String,
        expected_rev: Revision,
        callback: Callback<()>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(
            async move {
                plugin
                    .remove_tarball(&name, &filename, &expected_rev)
                    .await
            },
            callback,
        )
    }

    fn save_token_cb(&self, token: Token, callback: Callback<()>) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.save_token(token).await }, callback)
    }

    fn delete_token_cb(
        &self,
        user: String,
        key: String,
        callback: Callback<()>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.delete_token(&user, &key).await }, callback)
    }

    fn read_tokens_cb(
        &self,
        filter: TokenFilter,
        callback: Callback<Vec<Token>>,
    ) -> JoinHandle<()> {
        let plugin = Arc::clone(self);
        deliver(async move { plugin.read_tokens(&filter).await }, callback)
    }
}
