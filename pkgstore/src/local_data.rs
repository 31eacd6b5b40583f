//! Registry-wide local data: the list of locally published packages and the
//! registry secret, persisted as `{list, secret}` in the storage root.

use crate::error::StorageResult;
use crate::storage::{read_file_optional, save_file_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// File name of the local data document.
pub const LOCAL_DATA_FILE: &str = ".pkgstore-db.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LocalData {
    #[serde(default)]
    list: Vec<String>,
    #[serde(default)]
    secret: String,
}

/// Local package list and secret store.
#[derive(Debug)]
pub struct RegistryDb {
    path: PathBuf,
    fsync: bool,
    data: Mutex<Option<LocalData>>,
}

impl RegistryDb {
    pub fn new(root: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            path: root.as_ref().join(LOCAL_DATA_FILE),
            fsync,
            data: Mutex::new(None),
        }
    }

    async fn load(&self) -> StorageResult<LocalData> {
        match read_file_optional(&self.path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(LocalData::default()),
        }
    }

    /// Apply `change` to the document, saving only when it reports a change.
    async fn modify<F>(&self, change: F) -> StorageResult<()>
    where
        F: FnOnce(&mut LocalData) -> bool,
    {
        let mut cached = self.data.lock().await;
        let mut data = match cached.take() {
            Some(data) => data,
            None => self.load().await?,
        };
        let before = data.clone();
        if change(&mut data) {
            if let Err(e) = save_file_atomic(&self.path, serde_json::to_vec_pretty(&data)?, self.fsync).await {
                *cached = Some(before);
                return Err(e);
            }
        }
        *cached = Some(data);
        Ok(())
    }

    async fn snapshot(&self) -> StorageResult<LocalData> {
        let mut cached = self.data.lock().await;
        if cached.is_none() {
            *cached = Some(self.load().await?);
        }
        Ok(cached.clone().unwrap_or_default())
    }

    pub async fn add(&self, name: &str) -> StorageResult<()> {
        self.modify(|data| {
            if data.list.iter().any(|n| n == name) {
                return false;
            }
            data.list.push(name.to_string());
            debug!(package = %name, "Package added to local list");
            true
        })
        .await
    }

    pub async fn remove(&self, name: &str) -> StorageResult<()> {
        self.modify(|data| {
            let before = data.list.len();
            data.list.retain(|n| n != name);
            data.list.len() != before
        })
        .await
    }

    /// Locally published package names, in insertion order.
    pub async fn get(&self) -> StorageResult<Vec<String>> {
        Ok(self.snapshot().await?.list)
    }

    pub async fn get_secret(&self) -> StorageResult<String> {
        Ok(self.snapshot().await?.secret)
    }

    pub async fn set_secret(&self, secret: &str) -> StorageResult<()> {
        self.modify(|data| {
            if data.secret == secret {
                return false;
            }
            data.secret = secret.to_string();
            true
        })
        .await
    }
}
