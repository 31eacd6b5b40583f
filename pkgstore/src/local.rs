//! Local filesystem storage backend.
//!
//! Layout under the configured `storage` root:
//!
//! ```text
//! <storage>/
//!     .pkgstore-db.json        local package list and secret
//!     .pkgstore-tokens.json    auth tokens
//!     <package>/package.json   manifest
//!     <package>/<tarball>      committed tarballs
//!     @scope/<package>/...     scoped packages
//! ```

use crate::config::{RegistryConfig, StoreConfig};
use crate::error::{StorageError, StorageResult};
use crate::manifest::{Manifest, Revision, Version};
use crate::plugin::{MetadataFilter, Plugin, PluginFactory, PluginOptions, StoragePlugin};
use crate::store::PackageMetadataStore;
use crate::tarball::{AbortSignal, ReadTarball, UploadTarball};
use crate::token::{Token, TokenFilter, TokenStore};
use anyhow::Context;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{info, Instrument, Span};

pub struct LocalStorage {
    store: PackageMetadataStore,
    tokens: TokenStore,
    config: Arc<RegistryConfig>,
    logger: Span,
}

impl LocalStorage {
    pub fn with_filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.store = self.store.with_filter(filter);
        self
    }

    /// Effective configuration: global settings with this backend's `store`.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn metadata_store(&self) -> &PackageMetadataStore {
        &self.store
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.store.is_closed() {
            return Err(StorageError::InvalidState(
                "storage has been closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl PluginFactory for LocalStorage {
    type Config = StoreConfig;

    fn new(config: StoreConfig, options: PluginOptions) -> anyhow::Result<Self> {
        let mut merged = (*options.config).clone();
        merged.store = config;
        merged.validate()?;

        std::fs::create_dir_all(&merged.storage).with_context(|| {
            format!(
                "Failed to create storage directory {}",
                merged.storage.display()
            )
        })?;

        let store = PackageMetadataStore::from_config(&merged);
        let tokens = TokenStore::new(&merged.storage, merged.store.fsync);
        options.logger.in_scope(|| {
            info!(
                storage = %merged.storage.display(),
                max_update_attempts = merged.store.max_update_attempts,
                "Local storage ready"
            );
        });

        Ok(Self {
            store,
            tokens,
            config: Arc::new(merged),
            logger: options.logger,
        })
    }
}

#[async_trait::async_trait]
impl Plugin for LocalStorage {
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn close(&self) -> StorageResult<()> {
        self.store.close();
        self.logger.in_scope(|| info!("Local storage closed"));
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoragePlugin for LocalStorage {
    async fn get_package(&self, name: &str) -> StorageResult<Manifest> {
        self.store.get(name).instrument(self.logger.clone()).await
    }

    async fn create_package(&self, name: &str, manifest: Manifest) -> StorageResult<Manifest> {
        self.store
            .create(name, manifest)
            .instrument(self.logger.clone())
            .await
    }

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Version,
        tag: Option<&str>,
    ) -> StorageResult<Manifest> {
        self.store
            .add_version(name, version, metadata, tag)
            .instrument(self.logger.clone())
            .await
    }

    async fn merge_tags(
        &self,
        name: &str,
        tags: &IndexMap<String, String>,
    ) -> StorageResult<Manifest> {
        self.store
            .merge_tags(name, tags)
            .instrument(self.logger.clone())
            .await
    }

    async fn unpublish_version(&self, name: &str, version: &str) -> StorageResult<Manifest> {
        self.store
            .unpublish_version(name, version)
            .instrument(self.logger.clone())
            .await
    }

    async fn change_package(
        &self,
        name: &str,
        metadata: Manifest,
        expected_rev: &Revision,
    ) -> StorageResult<Manifest> {
        self.store
            .change_package(name, metadata, expected_rev)
            .instrument(self.logger.clone())
            .await
    }

    async fn remove_package(&self, name: &str) -> StorageResult<()> {
        self.store
            .remove_package(name)
            .instrument(self.logger.clone())
            .await
    }

    async fn star(&self, name: &str, user: &str) -> StorageResult<Manifest> {
        self.store
            .star(name, user)
            .instrument(self.logger.clone())
            .await
    }

    async fn unstar(&self, name: &str, user: &str) -> StorageResult<Manifest> {
        self.store
            .unstar(name, user)
            .instrument(self.logger.clone())
            .await
    }

    async fn update_from_uplink(
        &self,
        name: &str,
        uplink: &str,
        etag: &str,
        remote: Manifest,
    ) -> StorageResult<Manifest> {
        self.store
            .update_from_uplink(name, uplink, etag, &remote)
            .instrument(self.logger.clone())
            .await
    }

    async fn add_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.store
            .add_tarball(name, filename, signal)
            .instrument(self.logger.clone())
            .await
    }

    async fn replace_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<UploadTarball> {
        self.store
            .replace_tarball(name, filename, signal)
            .instrument(self.logger.clone())
            .await
    }

    async fn get_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: AbortSignal,
    ) -> StorageResult<ReadTarball> {
        self.store
            .get_tarball(name, filename, signal)
            .instrument(self.logger.clone())
            .await
    }

    async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        expected_rev: &Revision,
    ) -> StorageResult<()> {
        self.store
            .remove_tarball(name, filename, expected_rev)
            .instrument(self.logger.clone())
            .await
    }

    async fn has_file(&self, name: &str, filename: &str) -> StorageResult<bool> {
        self.store.has_file(name, filename).await
    }

    async fn save_token(&self, token: Token) -> StorageResult<()> {
        self.ensure_open()?;
        self.tokens
            .save_token(token)
            .instrument(self.logger.clone())
            .await
    }

    async fn delete_token(&self, user: &str, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.tokens
            .delete_token(user, key)
            .instrument(self.logger.clone())
            .await
    }

    async fn read_tokens(&self, filter: &TokenFilter) -> StorageResult<Vec<Token>> {
        self.tokens
            .read_tokens(filter)
            .instrument(self.logger.clone())
            .await
    }

    async fn local_packages(&self) -> StorageResult<Vec<String>> {
        self.store.registry_db().get().await
    }

    async fn get_secret(&self) -> StorageResult<String> {
        self.store.registry_db().get_secret().await
    }

    async fn set_secret(&self, secret: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.store.registry_db().set_secret(secret).await
    }
}
