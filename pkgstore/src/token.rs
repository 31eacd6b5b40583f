//! Persistent storage for auth tokens

use crate::error::{StorageError, StorageResult};
use crate::storage::{read_file_optional, save_file_atomic};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File name of the token document inside the storage root
pub const TOKENS_FILE: &str = ".pkgstore-tokens.json";

/// An API token issued to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub user: String,
    /// Secret value presented by clients
    pub token: String,
    /// Stable identifier used for deletion
    pub key: String,
    /// Networks the token may be used from; unrestricted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Vec<String>>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(with = "epoch_millis")]
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "epoch_millis_opt")]
    pub updated: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(user: &str, key: &str, token: &str) -> Self {
        Self {
            user: user.to_string(),
            token: token.to_string(),
            key: key.to_string(),
            cidr: None,
            readonly: false,
            created: Utc::now(),
            updated: None,
        }
    }

    /// Whether a request from `ip` may use this token.
    pub fn allows(&self, ip: IpAddr) -> bool {
        match self.cidr.as_deref() {
            None | Some([]) => true,
            Some(networks) => networks
                .iter()
                .filter_map(|n| parse_network(n))
                .any(|net| net.contains(&ip) || net.contains(&ip.to_canonical())),
        }
    }

    fn validate(&self) -> StorageResult<()> {
        if self.user.is_empty() || self.key.is_empty() {
            return Err(StorageError::Validation(
                "token user and key cannot be empty".to_string(),
            ));
        }
        for network in self.cidr.iter().flatten() {
            if parse_network(network).is_none() {
                return Err(StorageError::Validation(format!(
                    "invalid CIDR network '{network}' on token {}",
                    self.key
                )));
            }
        }
        Ok(())
    }
}

/// Selects the tokens of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFilter {
    pub user: String,
}

impl TokenFilter {
    pub fn user(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }
}

fn parse_network(raw: &str) -> Option<IpNet> {
    raw.trim().parse::<IpNet>().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenStorage {
    version: u32,
    #[serde(default)]
    tokens: Vec<Token>,
}

impl Default for TokenStorage {
    fn default() -> Self {
        Self {
            version: 1,
            tokens: Vec::new(),
        }
    }
}

/// Token persistence keyed by `(user, key)`.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    fsync: bool,
    lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(root: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            path: root.as_ref().join(TOKENS_FILE),
            fsync,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> StorageResult<TokenStorage> {
        match read_file_optional(&self.path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(TokenStorage::default()),
        }
    }

    async fn save(&self, storage: &TokenStorage) -> StorageResult<()> {
        save_file_atomic(&self.path, serde_json::to_vec_pretty(storage)?, self.fsync).await
    }

    /// Insert or replace the token with the same `(user, key)`.
    pub async fn save_token(&self, mut token: Token) -> StorageResult<()> {
        token.validate()?;
        let _guard = self.lock.lock().await;
        let mut storage = self.load().await?;

        match storage
            .tokens
            .iter_mut()
            .find(|t| t.user == token.user && t.key == token.key)
        {
            Some(existing) => {
                token.updated.get_or_insert_with(Utc::now);
                *existing = token.clone();
            }
            None => storage.tokens.push(token.clone()),
        }
        self.save(&storage).await?;
        info!(user = %token.user, key = %token.key, "Token saved");
        Ok(())
    }

    pub async fn delete_token(&self, user: &str, key: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().await;
        let mut storage = self.load().await?;
        let before = storage.tokens.len();
        storage.tokens.retain(|t| !(t.user == user && t.key == key));
        if storage.tokens.len() == before {
            return Err(StorageError::NotFound(format!("token {key} of user {user}")));
        }
        self.save(&storage).await?;
        info!(user = %user, key = %key, "Token deleted");
        Ok(())
    }

    /// Tokens of `filter.user`, oldest first.
    pub async fn read_tokens(&self, filter: &TokenFilter) -> StorageResult<Vec<Token>> {
        let storage = self.load().await?;
        let mut tokens: Vec<Token> = storage
            .tokens
            .into_iter()
            .filter(|t| t.user == filter.user)
            .collect();
        tokens.sort_by_key(|t| t.created);
        debug!(user = %filter.user, count = tokens.len(), "Tokens read");
        Ok(tokens)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Rfc3339(String),
}

impl RawTimestamp {
    fn into_datetime<E: serde::de::Error>(self) -> Result<DateTime<Utc>, E> {
        match self {
            RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| E::custom(format!("timestamp out of range: {ms}"))),
            RawTimestamp::Rfc3339(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| E::custom(format!("invalid timestamp '{raw}': {e}"))),
        }
    }
}

/// Epoch milliseconds on output; milliseconds or RFC 3339 on input.
mod epoch_millis {
    use super::RawTimestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        RawTimestamp::deserialize(deserializer)?.into_datetime()
    }
}

mod epoch_millis_opt {
    use super::RawTimestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_i64(value.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<RawTimestamp>::deserialize(deserializer)?
            .map(RawTimestamp::into_datetime)
            .transpose()
    }
}
