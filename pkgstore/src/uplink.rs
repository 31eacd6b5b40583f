//! # Uplink Cache Bookkeeping
//!
//! Tracks when each upstream registry was last consulted for a package
//! (`_uplinks` in the manifest) and folds upstream metadata into the local
//! manifest. The HTTP fetch itself belongs to the caller; it asks
//! [`UplinkCache::is_fresh`] with the uplink's configured `maxage` to decide
//! whether a fetch is due.

use crate::manifest::{DistFile, Manifest, TIME_CREATED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Freshness record of one uplink. Serialized as `{etag, fetched}` with
/// `fetched` in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkMetadata {
    #[serde(default)]
    pub etag: String,
    #[serde(rename = "fetched", with = "chrono::serde::ts_milliseconds")]
    pub fetched_at: DateTime<Utc>,
}

/// The `_uplinks` map of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UplinkCache(BTreeMap<String, UplinkMetadata>);

impl UplinkCache {
    /// Upserts the freshness record of `uplink`.
    pub fn record_fetch(&mut self, uplink: &str, etag: impl Into<String>, fetched_at: DateTime<Utc>) {
        self.0.insert(
            uplink.to_string(),
            UplinkMetadata {
                etag: etag.into(),
                fetched_at,
            },
        );
    }

    pub fn get(&self, uplink: &str) -> Option<&UplinkMetadata> {
        self.0.get(uplink)
    }

    /// True iff `uplink` was fetched less than `max_age` ago.
    pub fn is_fresh(&self, uplink: &str, max_age: Duration) -> bool {
        self.is_fresh_at(uplink, max_age, Utc::now())
    }

    /// [`is_fresh`](Self::is_fresh) evaluated at an explicit instant.
    pub fn is_fresh_at(&self, uplink: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(record) = self.0.get(uplink) else {
            return false;
        };
        let elapsed_ms = (now - record.fetched_at).num_milliseconds();
        let max_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        elapsed_ms < max_ms
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UplinkMetadata)> {
        self.0.iter()
    }
}

/// Folds `remote` (as served by `uplink`) into `local`.
///
/// Versions already present locally are never overwritten. Remote-only
/// versions are added and their tarballs recorded as `_distfiles` entries
/// pointing at the uplink. Remote dist-tags are adopted only for tag names
/// the local manifest does not set, and only when the target version exists.
pub fn merge_remote(local: &Manifest, remote: &Manifest, uplink: &str) -> Manifest {
    let mut merged = local.clone();
    let mut added = 0usize;

    for (key, version) in &remote.versions {
        if merged.versions.contains_key(key) {
            continue;
        }
        merged.versions.insert(key.clone(), version.clone());
        added += 1;

        if let Some(filename) = version.tarball_filename() {
            if !merged.attachments.contains_key(filename)
                && !merged.distfiles.contains_key(filename)
            {
                merged.distfiles.insert(
                    filename.to_string(),
                    DistFile {
                        url: version.dist.tarball.clone(),
                        sha: version.dist.shasum.clone(),
                        registry: Some(uplink.to_string()),
                    },
                );
            }
        }
        if let Some(published) = remote.time.get(key) {
            merged
                .time
                .entry(key.clone())
                .or_insert_with(|| published.clone());
        }
    }

    for (tag, version) in &remote.dist_tags {
        if !merged.dist_tags.contains_key(tag) && merged.versions.contains_key(version) {
            merged.dist_tags.insert(tag.clone(), version.clone());
        }
    }

    if let Some(created) = remote.time.get(TIME_CREATED) {
        merged
            .time
            .entry(TIME_CREATED.to_string())
            .or_insert_with(|| created.clone());
    }
    if merged.readme.is_none() {
        merged.readme = remote.readme.clone();
    }

    debug!(package = %local.name, uplink = %uplink, added, "Merged uplink metadata");
    merged
}
