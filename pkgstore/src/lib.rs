//! # Package Registry Storage
//!
//! Storage and auth backends for an npm-compatible registry proxy. A registry
//! service talks to backends only through the plugin contract, so backends can
//! be swapped without touching callers.
//!
//! ## Features
//!
//! - **Concurrency-safe manifests**: every mutation is a revision-gated
//!   read-modify-write with bounded retry
//! - **Streaming tarballs**: chunked writes and reads with cancellation and
//!   rollback, never buffering a whole tarball
//! - **Uplink bookkeeping**: per-upstream freshness records and metadata merge
//! - **Auth chain**: ordered backends with declared capabilities
//! - **Dual API surface**: async result-returning core with a callback adapter
//!
//! ## Key Modules
//!
//! - [`store`]: manifest CRUD and optimistic concurrency
//! - [`tarball`]: tarball write/read lifecycle
//! - [`uplink`]: uplink freshness and merge
//! - [`plugin`]: storage plugin contract and legacy adapter
//! - [`auth`]: auth capability chain
//! - [`token`]: token persistence
//! - [`config`]: registry configuration
//! - [`error`]: error taxonomy
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pkgstore::{LocalStorage, PluginFactory, PluginOptions, RegistryConfig, StoragePlugin};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(RegistryConfig::load("config.yaml")?);
//! let storage = LocalStorage::new(config.store.clone(), PluginOptions::new(config))?;
//! let manifest = storage.get_package("lodash").await?;
//! println!("{} is at revision {}", manifest.name, manifest.rev);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod hash_utils;
pub mod local;
pub mod local_data;
pub mod manifest;
pub mod plugin;
pub mod storage;
pub mod store;
pub mod tarball;
pub mod token;
pub mod uplink;
pub mod validation;

// Re-export key types for convenience
pub use auth::{AuthCapabilities, AuthChain, AuthError, AuthPlugin, AuthResult, RemoteUser};
pub use backend::{PackageStorage, MANIFEST_FILE};
pub use config::{PackageAccess, RegistryConfig, StoreConfig, UplinkConf};
pub use error::{ErrorCode, StorageError, StorageResult};
pub use local::LocalStorage;
pub use local_data::RegistryDb;
pub use manifest::{Attachment, Author, DistFile, Manifest, Revision, Version};
pub use plugin::{
    Callback, LegacyStorage, MetadataFilter, Plugin, PluginFactory, PluginOptions, StoragePlugin,
};
pub use store::PackageMetadataStore;
pub use tarball::{
    AbortController, AbortSignal, ReadTarball, TarballManager, UploadState, UploadTarball,
};
pub use token::{Token, TokenFilter, TokenStore};
pub use uplink::{merge_remote, UplinkCache, UplinkMetadata};
pub use validation::{
    validate_filename, validate_package_name, validate_version, MAX_FILENAME_LENGTH,
    MAX_PACKAGE_NAME_LENGTH, MAX_VERSION_LENGTH,
};
