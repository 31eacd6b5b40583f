//! # Package Manifest Model
//!
//! The JSON document stored per package. Field names and nesting follow the
//! npm registry protocol exactly (`dist-tags`, `_attachments`, `_distfiles`,
//! `_uplinks`, `_rev`); keys this crate does not model are carried through
//! untouched in the `extra` maps.
//!
//! Fields that the protocol leaves loosely typed (author, repository, bugs,
//! keywords) are modelled as explicit variants so they are checked when the
//! document is parsed instead of travelling through the system as raw JSON.

use crate::error::{StorageError, StorageResult};
use crate::uplink::UplinkCache;
use crate::validation::{validate_filename, validate_package_name, validate_version};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Reserved `time` key recording the first publish.
pub const TIME_CREATED: &str = "created";
/// Reserved `time` key recording the latest mutation of the version set.
pub const TIME_MODIFIED: &str = "modified";

/// Opaque revision token used for optimistic concurrency.
///
/// Revisions are decimal counters (`"1"`, `"2"`, ...). A stored revision of the
/// `"N-suffix"` form written by other registries continues from `N`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn counter(&self) -> u64 {
        self.0
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    /// The revision a successful write of this manifest produces.
    pub fn next(&self) -> Revision {
        Revision((self.counter() + 1).to_string())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(rev: &str) -> Self {
        Self(rev.to_string())
    }
}

impl PartialEq<&str> for Revision {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A person field: either the `"Name <email> (url)"` shorthand or an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Author {
    Raw(String),
    Structured {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl Author {
    pub fn name(&self) -> &str {
        match self {
            Author::Raw(raw) => raw
                .split(['<', '('])
                .next()
                .map(str::trim)
                .unwrap_or_default(),
            Author::Structured { name, .. } => name,
        }
    }

    /// Expands the string shorthand into the structured form.
    pub fn normalized(&self) -> Author {
        static PERSON: OnceLock<Option<Regex>> = OnceLock::new();
        let Author::Raw(raw) = self else {
            return self.clone();
        };
        let parsed = PERSON
            .get_or_init(|| Regex::new(r"^([^<(]*?)\s*(?:<([^>]*)>)?\s*(?:\(([^)]*)\))?\s*$").ok())
            .as_ref()
            .and_then(|re| re.captures(raw));
        match parsed {
            Some(caps) => Author::Structured {
                name: caps.get(1).map_or("", |m| m.as_str()).trim().to_string(),
                email: caps.get(2).map(|m| m.as_str().to_string()),
                url: caps.get(3).map(|m| m.as_str().to_string()),
                username: None,
            },
            None => Author::Structured {
                name: raw.trim().to_string(),
                email: None,
                url: None,
                username: None,
            },
        }
    }
}

/// `repository` is either a bare URL/shorthand or a typed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Repository {
    Url(String),
    Structured {
        #[serde(rename = "type")]
        kind: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<String>,
    },
}

/// `bugs` is either an issue tracker URL or an object with url and/or email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bugs {
    Url(String),
    Structured {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Keywords {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

/// The `dist` block of a version: where its tarball lives and how to verify it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default)]
    pub shasum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(rename = "fileCount", default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(rename = "unpackedSize", default, skip_serializing_if = "Option::is_none")]
    pub unpacked_size: Option<u64>,
    #[serde(rename = "npm-signature", default, skip_serializing_if = "Option::is_none")]
    pub npm_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

pub type DependencyMap = BTreeMap<String, String>;

/// Immutable metadata of one published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Author>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bugs: Option<Bugs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Keywords>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: DependencyMap,
    #[serde(rename = "devDependencies", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: DependencyMap,
    #[serde(rename = "peerDependencies", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: DependencyMap,
    #[serde(rename = "optionalDependencies", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: DependencyMap,
    pub dist: Dist,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_npmUser", default, skip_serializing_if = "Option::is_none")]
    pub npm_user: Option<Author>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Version {
    /// Minimal version record pointing at `tarball`.
    pub fn new(name: &str, version: &str, tarball: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            author: None,
            maintainers: Vec::new(),
            contributors: Vec::new(),
            license: None,
            repository: None,
            bugs: None,
            homepage: None,
            keywords: None,
            main: None,
            scripts: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            peer_dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            dist: Dist {
                tarball: tarball.into(),
                ..Dist::default()
            },
            readme: None,
            deprecated: None,
            id: Some(format!("{name}@{version}")),
            npm_user: None,
            extra: BTreeMap::new(),
        }
    }

    /// Filename component of `dist.tarball` (`.../-/foo-1.0.0.tgz` → `foo-1.0.0.tgz`).
    pub fn tarball_filename(&self) -> Option<&str> {
        tarball_filename(&self.dist.tarball)
    }
}

/// Extract the filename from a tarball URL or path.
pub fn tarball_filename(tarball: &str) -> Option<&str> {
    let path = tarball.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/').next().filter(|f| !f.is_empty())
}

/// A locally stored (or staged) tarball.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Inline base64 payload of a publish request, dropped once committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A tarball served by an uplink rather than stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistFile {
    pub url: String,
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// The canonical package record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub versions: IndexMap<String, Version>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: IndexMap<String, String>,
    #[serde(default)]
    pub time: IndexMap<String, String>,
    #[serde(default)]
    pub users: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(rename = "_distfiles", default)]
    pub distfiles: BTreeMap<String, DistFile>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(rename = "_uplinks", default)]
    pub uplinks: UplinkCache,
    #[serde(rename = "_rev", default)]
    pub rev: Revision,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Manifest {
    /// An empty manifest that has never been written.
    pub fn new(name: &str) -> Self {
        Self {
            id: Some(name.to_string()),
            name: name.to_string(),
            versions: IndexMap::new(),
            dist_tags: IndexMap::new(),
            time: IndexMap::new(),
            users: BTreeMap::new(),
            readme: None,
            distfiles: BTreeMap::new(),
            attachments: BTreeMap::new(),
            uplinks: UplinkCache::default(),
            rev: Revision::default(),
            extra: BTreeMap::new(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn latest(&self) -> Option<&Version> {
        self.dist_tags
            .get("latest")
            .and_then(|v| self.versions.get(v))
    }

    /// Every tarball filename referenced by a version, with its owner.
    pub fn referenced_tarballs(&self) -> impl Iterator<Item = (&str, &Version)> {
        self.versions
            .values()
            .filter_map(|v| v.tarball_filename().map(|f| (f, v)))
    }

    /// Every tarball filename this manifest owns, local or remote.
    pub fn owned_files(&self) -> Vec<String> {
        self.attachments
            .keys()
            .chain(self.distfiles.keys())
            .cloned()
            .collect()
    }

    /// Rejects tags pointing at a version this manifest does not hold.
    pub fn validate_tags<'a>(
        &self,
        tags: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> StorageResult<()> {
        for (tag, version) in tags {
            if !self.versions.contains_key(version) {
                return Err(StorageError::Validation(format!(
                    "dist-tag '{tag}' of {} references unknown version {version}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Checks the structural invariants of a manifest about to be persisted.
    pub fn validate(&self) -> StorageResult<()> {
        validate_package_name(&self.name)?;

        for (key, version) in &self.versions {
            validate_version(key)?;
            if &version.version != key {
                return Err(StorageError::Validation(format!(
                    "versions['{key}'] declares version {}",
                    version.version
                )));
            }
            if version.name != self.name {
                return Err(StorageError::Validation(format!(
                    "versions['{key}'] belongs to package {}, not {}",
                    version.name, self.name
                )));
            }
        }

        self.validate_tags(&self.dist_tags)?;

        for filename in self.attachments.keys().chain(self.distfiles.keys()) {
            validate_filename(filename)?;
        }
        if let Some(both) = self
            .attachments
            .keys()
            .find(|f| self.distfiles.contains_key(*f))
        {
            return Err(StorageError::Validation(format!(
                "tarball {both} is recorded both locally and remotely"
            )));
        }

        Ok(())
    }

    /// Checks that every referenced tarball is owned exactly once.
    pub fn validate_committed(&self) -> StorageResult<()> {
        self.validate()?;
        for (filename, version) in self.referenced_tarballs() {
            if !self.attachments.contains_key(filename) && !self.distfiles.contains_key(filename) {
                return Err(StorageError::Validation(format!(
                    "tarball {filename} of version {} is neither local nor remote",
                    version.version
                )));
            }
        }
        Ok(())
    }

    /// Makes every referenced tarball owned exactly once.
    ///
    /// `is_local` answers whether the tarball file is committed in this
    /// backend. Local files win over remote references.
    pub fn reconcile_tarballs(&mut self, is_local: impl Fn(&str) -> bool) {
        let referenced: Vec<(String, String, String, String)> = self
            .referenced_tarballs()
            .map(|(f, v)| {
                (
                    f.to_string(),
                    v.version.clone(),
                    v.dist.tarball.clone(),
                    v.dist.shasum.clone(),
                )
            })
            .collect();

        for (filename, version, url, shasum) in referenced {
            if is_local(&filename) {
                self.distfiles.remove(&filename);
                let entry = self.attachments.entry(filename).or_default();
                entry.data = None;
                if entry.version.is_none() {
                    entry.version = Some(version);
                }
                if entry.shasum.is_none() && !shasum.is_empty() {
                    entry.shasum = Some(shasum);
                }
            } else if !self.distfiles.contains_key(&filename) {
                self.attachments.remove(&filename);
                self.distfiles.insert(
                    filename,
                    DistFile {
                        url,
                        sha: shasum,
                        registry: None,
                    },
                );
            } else {
                self.attachments.remove(&filename);
            }
        }
    }
}
