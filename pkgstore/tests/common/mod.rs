//! Common test utilities and helpers
//!
//! Shared setup for the integration tests: an isolated storage root per test
//! and helpers to publish tarballs and versions through the plugin contract.

#![allow(dead_code)]

use anyhow::Result;
use pkgstore::{
    AbortSignal, Attachment, LocalStorage, PluginFactory, PluginOptions, RegistryConfig,
    StoragePlugin, StoreConfig, Version,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Test storage setup result
pub struct TestSetup {
    pub temp_dir: TempDir,
    pub config: Arc<RegistryConfig>,
    pub storage: Arc<LocalStorage>,
}

/// Creates a local storage backend rooted in a fresh temporary directory
pub fn create_test_setup() -> Result<TestSetup> {
    create_test_setup_with(StoreConfig {
        fsync: false,
        ..StoreConfig::default()
    })
}

pub fn create_test_setup_with(store: StoreConfig) -> Result<TestSetup> {
    let temp_dir = TempDir::new()?;
    let mut config = RegistryConfig::new(temp_dir.path().join("storage"));
    config.store = store.clone();
    let config = Arc::new(config);

    let storage = LocalStorage::new(store, PluginOptions::new(config.clone()))?;

    Ok(TestSetup {
        temp_dir,
        config,
        storage: Arc::new(storage),
    })
}

pub fn tarball_name(name: &str, version: &str) -> String {
    let bare = name.rsplit('/').next().unwrap_or(name);
    format!("{bare}-{version}.tgz")
}

/// Version metadata whose tarball lives in this registry
pub fn local_version(name: &str, version: &str) -> Version {
    Version::new(
        name,
        version,
        format!(
            "http://localhost:4873/{name}/-/{}",
            tarball_name(name, version)
        ),
    )
}

/// Streams `content` into a committed tarball, in small chunks
pub async fn upload_tarball(
    storage: &LocalStorage,
    name: &str,
    filename: &str,
    content: &[u8],
) -> Result<Attachment> {
    let mut upload = storage
        .add_tarball(name, filename, AbortSignal::never())
        .await?;
    for chunk in content.chunks(3) {
        upload.write(chunk).await?;
    }
    Ok(upload.done().await?)
}

/// Uploads the tarball and publishes the version, like `npm publish`
pub async fn publish(
    storage: &LocalStorage,
    name: &str,
    version: &str,
    tag: Option<&str>,
) -> Result<pkgstore::Manifest> {
    let filename = tarball_name(name, version);
    upload_tarball(
        storage,
        name,
        &filename,
        format!("tarball of {name}@{version}").as_bytes(),
    )
    .await?;
    Ok(storage
        .add_version(name, version, local_version(name, version), tag)
        .await?)
}
