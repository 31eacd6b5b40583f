//! Plugin contract tests
//!
//! Construction from configuration, metadata filters, lifecycle, tokens and
//! uplink bookkeeping, all exercised through the trait objects a registry
//! service would hold.

use anyhow::Result;
use pkgstore::{
    AbortSignal, LocalStorage, Manifest, MetadataFilter, Plugin, PluginFactory, PluginOptions,
    RegistryConfig, StorageError, StoragePlugin, StorageResult, StoreConfig, Token, TokenFilter,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

mod common;
use common::{create_test_setup, local_version, publish};

/// Hides prerelease versions from readers.
struct HidePrereleases;

#[async_trait::async_trait]
impl Plugin for HidePrereleases {
    fn version(&self) -> &str {
        "0.0.1"
    }
}

#[async_trait::async_trait]
impl MetadataFilter for HidePrereleases {
    async fn filter_metadata(&self, mut manifest: Manifest) -> StorageResult<Manifest> {
        manifest.versions.retain(|v, _| !v.contains('-'));
        manifest
            .dist_tags
            .retain(|_, v| manifest.versions.contains_key(v));
        Ok(manifest)
    }
}

struct RejectAll;

#[async_trait::async_trait]
impl Plugin for RejectAll {
    fn version(&self) -> &str {
        "0.0.1"
    }
}

#[async_trait::async_trait]
impl MetadataFilter for RejectAll {
    async fn filter_metadata(&self, manifest: Manifest) -> StorageResult<Manifest> {
        Err(StorageError::Forbidden(format!("{} is embargoed", manifest.name)))
    }
}

#[tokio::test]
async fn test_load_from_yaml_config() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage_dir = temp_dir.path().join("storage");
    let config_path = temp_dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
storage: {}
uplinks:
  npmjs:
    url: https://registry.npmjs.org/
    maxage: 2m
packages:
  "@internal/*":
    access: $authenticated
    publish: admins
  "**":
    access: $all
    publish: $authenticated
    proxy: npmjs
store:
  max_update_attempts: 3
  fsync: false
"#,
            storage_dir.display()
        ),
    )?;

    let config = Arc::new(RegistryConfig::load(&config_path)?);
    let storage = LocalStorage::new(config.store.clone(), PluginOptions::new(config.clone()))?;

    assert!(storage_dir.is_dir());
    assert_eq!(storage.config().store.max_update_attempts, 3);
    assert_eq!(config.uplinks["npmjs"].maxage, Duration::from_secs(120));
    assert_eq!(
        config
            .uplinks_for("lodash")
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>(),
        ["npmjs"]
    );
    assert!(config.uplinks_for("@internal/tools").is_empty());
    assert_eq!(storage.version(), env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_store_config_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = Arc::new(RegistryConfig::new(temp_dir.path()));
    let result = LocalStorage::new(
        StoreConfig {
            max_update_attempts: 0,
            ..StoreConfig::default()
        },
        PluginOptions::new(config),
    );
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_filters_apply_on_read_only() -> Result<()> {
    let setup = create_test_setup()?;
    let storage = Arc::try_unwrap(setup.storage)
        .map_err(|_| anyhow::anyhow!("storage still shared"))?
        .with_filter(Arc::new(HidePrereleases));

    publish(&storage, "foo", "1.0.0", Some("latest")).await?;
    let written = publish(&storage, "foo", "2.0.0-rc.1", Some("next")).await?;
    assert!(written.versions.contains_key("2.0.0-rc.1"));

    let read = storage.get_package("foo").await?;
    assert_eq!(read.versions.keys().collect::<Vec<_>>(), ["1.0.0"]);
    assert!(!read.dist_tags.contains_key("next"));

    // The stored document is untouched.
    let stored = storage.metadata_store().package("foo")?.read_package().await?;
    assert!(stored.versions.contains_key("2.0.0-rc.1"));
    Ok(())
}

#[tokio::test]
async fn test_filter_error_is_surfaced() -> Result<()> {
    let setup = create_test_setup()?;
    let storage = Arc::try_unwrap(setup.storage)
        .map_err(|_| anyhow::anyhow!("storage still shared"))?
        .with_filter(Arc::new(HidePrereleases))
        .with_filter(Arc::new(RejectAll));

    publish(&storage, "foo", "1.0.0", None).await?;
    assert!(matches!(
        storage.get_package("foo").await,
        Err(StorageError::Forbidden(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_closed_storage_rejects_mutations() -> Result<()> {
    let setup = create_test_setup()?;
    let storage: Arc<dyn StoragePlugin> = setup.storage.clone();
    publish(&setup.storage, "foo", "1.0.0", None).await?;

    storage.close().await?;

    assert!(matches!(
        storage
            .add_version("foo", "1.1.0", local_version("foo", "1.1.0"), None)
            .await,
        Err(StorageError::InvalidState(_))
    ));
    assert!(matches!(
        storage
            .add_tarball("foo", "foo-1.1.0.tgz", AbortSignal::never())
            .await,
        Err(StorageError::InvalidState(_))
    ));
    assert!(matches!(
        storage.save_token(Token::new("alice", "k1", "s")).await,
        Err(StorageError::InvalidState(_))
    ));
    // Reads still work.
    assert_eq!(storage.get_package("foo").await?.rev, "1");
    Ok(())
}

#[tokio::test]
async fn test_tokens_round_trip_through_plugin() -> Result<()> {
    let setup = create_test_setup()?;
    let storage = &setup.storage;

    let mut restricted = Token::new("alice", "ci", "s3cret");
    restricted.cidr = Some(vec!["10.0.0.0/8".to_string()]);
    restricted.readonly = true;
    storage.save_token(restricted).await?;
    storage.save_token(Token::new("alice", "laptop", "other")).await?;
    storage.save_token(Token::new("bob", "laptop", "bobs")).await?;

    let tokens = storage.read_tokens(&TokenFilter::user("alice")).await?;
    assert_eq!(
        tokens.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(),
        ["ci", "laptop"]
    );
    assert!(tokens[0].readonly);
    assert!(tokens[0].allows("10.1.2.3".parse()?));
    assert!(!tokens[0].allows("192.168.1.1".parse()?));

    let mut bad = Token::new("alice", "broken", "x");
    bad.cidr = Some(vec!["not-a-network".to_string()]);
    assert!(matches!(
        storage.save_token(bad).await,
        Err(StorageError::Validation(_))
    ));

    storage.delete_token("alice", "ci").await?;
    let tokens = storage.read_tokens(&TokenFilter::user("alice")).await?;
    assert_eq!(tokens.len(), 1);
    assert_eq!(
        storage.read_tokens(&TokenFilter::user("bob")).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_secret_persists_across_instances() -> Result<()> {
    let setup = create_test_setup()?;
    setup.storage.set_secret("0123456789abcdef").await?;

    let reopened = LocalStorage::new(
        setup.config.store.clone(),
        PluginOptions::new(setup.config.clone()),
    )?;
    assert_eq!(reopened.get_secret().await?, "0123456789abcdef");
    Ok(())
}

#[tokio::test]
async fn test_uplink_merge_keeps_local_versions() -> Result<()> {
    let setup = create_test_setup()?;
    let storage = &setup.storage;
    publish(storage, "foo", "1.0.0", Some("latest")).await?;

    let mut remote = Manifest::new("foo");
    for v in ["1.0.0", "1.1.0"] {
        let mut version = local_version("foo", v);
        version.dist.tarball = format!("https://registry.npmjs.org/foo/-/foo-{v}.tgz");
        version.description = Some("from upstream".to_string());
        remote.versions.insert(v.to_string(), version);
    }
    remote
        .dist_tags
        .insert("latest".to_string(), "1.1.0".to_string());
    remote
        .dist_tags
        .insert("next".to_string(), "1.1.0".to_string());

    let merged = storage
        .update_from_uplink("foo", "npmjs", "W/\"abc\"", remote)
        .await?;

    assert_eq!(merged.versions["1.0.0"].description, None);
    assert_eq!(
        merged.versions["1.1.0"].description.as_deref(),
        Some("from upstream")
    );
    assert_eq!(merged.dist_tags["latest"], "1.0.0");
    assert_eq!(merged.dist_tags["next"], "1.1.0");
    assert!(merged.attachments.contains_key("foo-1.0.0.tgz"));
    assert!(merged.distfiles.contains_key("foo-1.1.0.tgz"));

    let record = merged.uplinks.get("npmjs").expect("fetch recorded");
    assert_eq!(record.etag, "W/\"abc\"");
    assert!(merged.uplinks.is_fresh("npmjs", Duration::from_secs(120)));
    assert!(!merged.uplinks.is_fresh("other", Duration::from_secs(120)));
    Ok(())
}

#[tokio::test]
async fn test_uplink_creates_package_when_absent() -> Result<()> {
    let setup = create_test_setup()?;
    let mut remote = Manifest::new("left-pad");
    let mut version = local_version("left-pad", "1.3.0");
    version.dist.tarball = "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz".to_string();
    remote.versions.insert("1.3.0".to_string(), version);

    let saved = setup
        .storage
        .update_from_uplink("left-pad", "npmjs", "", remote)
        .await?;
    assert_eq!(saved.rev, "1");
    assert!(saved.distfiles.contains_key("left-pad-1.3.0.tgz"));
    assert!(!setup
        .storage
        .has_file("left-pad", "left-pad-1.3.0.tgz")
        .await?);
    Ok(())
}

#[tokio::test]
async fn test_star_and_unstar() -> Result<()> {
    let setup = create_test_setup()?;
    let storage = &setup.storage;
    publish(storage, "foo", "1.0.0", None).await?;

    let starred = storage.star("foo", "alice").await?;
    assert_eq!(starred.users.get("alice"), Some(&true));
    let unstarred = storage.unstar("foo", "alice").await?;
    assert!(unstarred.users.is_empty());
    assert_eq!(unstarred.rev, "3");
    Ok(())
}
