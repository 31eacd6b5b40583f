//! # Configuration Management
//!
//! Structured registry configuration, loaded from YAML and validated eagerly.
//! Unknown keys are rejected at parse time so a typo never silently falls
//! back to a default.
//!
//! ## Configuration Structure
//!
//! - `storage`: root directory of the filesystem backend
//! - [`UplinkConf`]: upstream registries and their fetch cadence
//! - [`PackageAccess`]: per-pattern access lists consumed by the auth chain
//! - [`LogConfig`]: logging bootstrap (see `pkgstore-logging`)
//! - [`StoreConfig`]: tuning of the local filesystem backend
//!
//! ```rust,no_run
//! # use pkgstore::config::RegistryConfig;
//! let config = RegistryConfig::load("config.yaml")?;
//! let access = config.matched_package_access("@scope/pkg");
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Context, Result};
use glob::{MatchOptions, Pattern};
use indexmap::IndexMap;
use pkgstore_logging::LogConfig;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Default `max_body_size` (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Upper bound accepted for `store.max_update_attempts`.
pub const MAX_UPDATE_ATTEMPTS_LIMIT: u32 = 16;

/// Top-level registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Root directory of the filesystem storage backend
    pub storage: PathBuf,
    /// Upstream registries keyed by name
    #[serde(default)]
    pub uplinks: IndexMap<String, UplinkConf>,
    /// Access lists keyed by package glob, first match wins
    #[serde(default)]
    pub packages: IndexMap<String, PackageAccess>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Largest tarball accepted, in bytes
    #[serde(default = "default_max_body_size", deserialize_with = "size")]
    pub max_body_size: u64,
}

/// One upstream registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkConf {
    #[serde(deserialize_with = "absolute_url")]
    pub url: Url,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Whether tarballs fetched through this uplink are cached locally
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_timeout", deserialize_with = "interval")]
    pub timeout: Duration,
    /// How long a fetched manifest stays fresh
    #[serde(default = "default_maxage", deserialize_with = "interval")]
    pub maxage: Duration,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(default = "default_fail_timeout", deserialize_with = "interval")]
    pub fail_timeout: Duration,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<UplinkAuth>,
    #[serde(default = "default_true")]
    pub strict_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthScheme {
    #[serde(alias = "bearer")]
    Bearer,
    #[serde(alias = "basic")]
    Basic,
}

/// Credentials sent to an uplink.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkAuth {
    #[serde(rename = "type")]
    pub scheme: AuthScheme,
    #[serde(default)]
    pub token: Option<String>,
    /// Environment variable holding the token
    #[serde(default)]
    pub token_env: Option<String>,
}

impl UplinkAuth {
    /// The configured token, inline value first.
    pub fn resolve_token(&self) -> Option<String> {
        self.token.clone().or_else(|| {
            self.token_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }

    pub fn authorization_header(&self) -> Option<String> {
        let token = self.resolve_token()?;
        Some(match self.scheme {
            AuthScheme::Bearer => format!("Bearer {token}"),
            AuthScheme::Basic => format!("Basic {token}"),
        })
    }
}

/// Access entry for one package pattern. Each list holds user names,
/// group names, or the pseudo-groups `$all`, `$anonymous`, `$authenticated`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageAccess {
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default, deserialize_with = "name_list")]
    pub publish: Option<Vec<String>>,
    #[serde(default, deserialize_with = "name_list")]
    pub proxy: Option<Vec<String>>,
    #[serde(default, deserialize_with = "name_list")]
    pub access: Option<Vec<String>>,
    /// Falls back to `publish` when unset
    #[serde(default, deserialize_with = "name_list")]
    pub unpublish: Option<Vec<String>>,
}

impl PackageAccess {
    pub fn access_list(&self) -> &[String] {
        self.access.as_deref().unwrap_or_default()
    }

    pub fn publish_list(&self) -> &[String] {
        self.publish.as_deref().unwrap_or_default()
    }

    pub fn unpublish_list(&self) -> &[String] {
        self.unpublish
            .as_deref()
            .unwrap_or_else(|| self.publish_list())
    }

    pub fn proxy_list(&self) -> &[String] {
        self.proxy.as_deref().unwrap_or_default()
    }
}

/// Settings of the local filesystem backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Attempts of one manifest read-modify-write before giving up
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
    /// Read chunk size for tarball streams, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Sync manifests and tarballs to disk before publishing them
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_update_attempts: default_max_update_attempts(),
            chunk_size: default_chunk_size(),
            fsync: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_body_size() -> u64 {
    DEFAULT_MAX_BODY_SIZE
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_maxage() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_max_fails() -> u32 {
    2
}

fn default_fail_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_update_attempts() -> u32 {
    5
}

fn default_chunk_size() -> usize {
    crate::tarball::DEFAULT_CHUNK_SIZE
}

const PATTERN_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl RegistryConfig {
    /// Minimal configuration rooted at `storage`.
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        RegistryConfig {
            storage: storage.into(),
            uplinks: IndexMap::new(),
            packages: IndexMap::new(),
            log: LogConfig::default(),
            store: StoreConfig::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: RegistryConfig =
            serde_yaml_ng::from_str(raw).context("Failed to parse registry config")?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for (pattern, access) in &self.packages {
            Pattern::new(pattern)
                .with_context(|| format!("Invalid package pattern '{pattern}'"))?;
            for uplink in access.proxy_list() {
                if !self.uplinks.contains_key(uplink) {
                    bail!("Package pattern '{pattern}' proxies to unknown uplink '{uplink}'");
                }
            }
        }

        let attempts = self.store.max_update_attempts;
        if !(1..=MAX_UPDATE_ATTEMPTS_LIMIT).contains(&attempts) {
            bail!(
                "store.max_update_attempts must be between 1 and {MAX_UPDATE_ATTEMPTS_LIMIT}, got {attempts}"
            );
        }
        if self.store.chunk_size == 0 {
            bail!("store.chunk_size must be greater than zero");
        }
        if self.max_body_size == 0 {
            bail!("max_body_size must be greater than zero");
        }
        Ok(())
    }

    /// Access entry of the first pattern matching `name`.
    pub fn matched_package_access(&self, name: &str) -> Option<&PackageAccess> {
        self.packages.iter().find_map(|(pattern, access)| {
            Pattern::new(pattern)
                .ok()
                .filter(|p| p.matches_with(name, PATTERN_OPTIONS))
                .map(|_| access)
        })
    }

    /// Uplinks consulted for `name`, in configured order.
    pub fn uplinks_for(&self, name: &str) -> Vec<(&str, &UplinkConf)> {
        let Some(access) = self.matched_package_access(name) else {
            return Vec::new();
        };
        access
            .proxy_list()
            .iter()
            .filter_map(|u| self.uplinks.get_key_value(u))
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }
}

/// Parse an interval such as `"2m"`, `"1h 30m"`, `"500ms"` or `"10"`
/// (bare numbers are seconds).
pub fn parse_interval(raw: &str) -> Result<Duration> {
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = TOKEN
        .get_or_init(|| Regex::new(r"^((?:0|[1-9][0-9]*)(?:\.[0-9]+)?)(ms|s|m|h|d|w|M|y)?$").ok())
        .as_ref()
        .context("interval pattern failed to compile")?;

    let mut total_ms = 0f64;
    let mut tokens = 0;
    for token in raw.split_whitespace() {
        let caps = re
            .captures(token)
            .with_context(|| format!("Invalid interval '{raw}'"))?;
        let value: f64 = caps[1]
            .parse()
            .with_context(|| format!("Invalid interval '{raw}'"))?;
        let unit_ms = match caps.get(2).map(|m| m.as_str()) {
            Some("ms") => 1.0,
            None | Some("s") => 1_000.0,
            Some("m") => 60_000.0,
            Some("h") => 3_600_000.0,
            Some("d") => 86_400_000.0,
            Some("w") => 7.0 * 86_400_000.0,
            Some("M") => 30.0 * 86_400_000.0,
            Some("y") => 365.0 * 86_400_000.0,
            Some(other) => bail!("Unknown interval unit '{other}'"),
        };
        total_ms += value * unit_ms;
        tokens += 1;
    }
    if tokens == 0 {
        bail!("Interval cannot be empty");
    }
    Ok(Duration::from_millis(total_ms.round() as u64))
}

/// Parse a size such as `"10mb"`, `"512kb"` or `"1024"` (bytes).
pub fn parse_size(raw: &str) -> Result<u64> {
    let lower = raw.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid size '{raw}'"))?;
    let multiplier = match unit.trim() {
        "" | "b" => 1u64,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        other => bail!("Unknown size unit '{other}' in '{raw}'"),
    };
    Ok((value * multiplier as f64) as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Number(f64),
    Text(String),
}

fn interval<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawScalar::deserialize(deserializer)? {
        RawScalar::Number(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        RawScalar::Number(secs) => Err(serde::de::Error::custom(format!(
            "interval cannot be negative: {secs}"
        ))),
        RawScalar::Text(raw) => parse_interval(&raw).map_err(serde::de::Error::custom),
    }
}

fn size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match RawScalar::deserialize(deserializer)? {
        RawScalar::Number(bytes) if bytes >= 0.0 => Ok(bytes as u64),
        RawScalar::Number(bytes) => Err(serde::de::Error::custom(format!(
            "size cannot be negative: {bytes}"
        ))),
        RawScalar::Text(raw) => parse_size(&raw).map_err(serde::de::Error::custom),
    }
}

fn absolute_url<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Url, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let url = Url::parse(&raw).map_err(|e| serde::de::Error::custom(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(serde::de::Error::custom(format!(
            "uplink url must be http or https: {raw}"
        )));
    }
    Ok(url)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NameList {
    Spaced(String),
    List(Vec<String>),
}

fn name_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<NameList>::deserialize(deserializer)?.map(|names| match names {
        NameList::Spaced(raw) => raw.split_whitespace().map(str::to_string).collect(),
        NameList::List(list) => list,
    }))
}
