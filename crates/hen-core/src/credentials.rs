use crate::util::atomic_write;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// Answers whether a nick/password pair may log in.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, nick: &str, password: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new<I, N, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(nick, password)| (nick.into(), password.into()))
                .collect(),
        }
    }

    /// Accounts available when no credentials file is configured.
    pub fn demo() -> Self {
        Self::new([("magnus", "qwerty"), ("bobby", "12345"), ("svea", "frog")])
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn verify(&self, nick: &str, password: &str) -> anyhow::Result<bool> {
        Ok(self.users.get(nick).is_some_and(|p| p == password))
    }
}

/// On-disk form: a flat table of `nick = "password"` pairs.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct CredentialsFile {
    users: BTreeMap<String, String>,
}

/// TOML file of `nick = "password"` pairs, re-read on every lookup.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load_inner(path: &Path) -> anyhow::Result<CredentialsFile> {
        if !path.exists() {
            return Ok(CredentialsFile::default());
        }
        let raw = std::fs::read_to_string(path).context("read credentials")?;
        match toml::from_str::<CredentialsFile>(&raw) {
            Ok(file) => Ok(file),
            Err(err) => {
                warn!(path = %path.display(), %err, "unparseable credentials file");
                Ok(CredentialsFile::default())
            }
        }
    }

    fn save_inner(path: &Path, file: &CredentialsFile) -> anyhow::Result<()> {
        let data = toml::to_string_pretty(file)?;
        atomic_write(path, data.as_bytes())
    }

    pub async fn add(&self, nick: &str, password: &str) -> anyhow::Result<()> {
        if nick.is_empty() || nick.contains(char::is_whitespace) || nick.contains('@') {
            anyhow::bail!("invalid nick {nick:?}");
        }
        let _guard = self.lock.lock().await;
        let mut file = Self::load_inner(&self.path)?;
        file.users.insert(nick.to_string(), password.to_string());
        Self::save_inner(&self.path, &file)
    }

    /// Returns whether the nick existed.
    pub async fn remove(&self, nick: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let mut file = Self::load_inner(&self.path)?;
        if file.users.remove(nick).is_none() {
            return Ok(false);
        }
        Self::save_inner(&self.path, &file)?;
        Ok(true)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let file = Self::load_inner(&self.path)?;
        Ok(file.users.into_keys().collect())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn verify(&self, nick: &str, password: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let file = Self::load_inner(&self.path)?;
        Ok(file.users.get(nick).is_some_and(|p| p == password))
    }
}

#[cfg(feature = "redis")]
pub mod redis_store {
    use super::*;
    use redis::AsyncCommands;

    /// One hash: field = nick, value = password.
    #[derive(Clone)]
    pub struct RedisCredentialStore {
        client: redis::Client,
        key: String,
    }

    impl RedisCredentialStore {
        pub fn new(client: redis::Client, key: impl Into<String>) -> Self {
            Self {
                client,
                key: key.into(),
            }
        }
    }

    #[async_trait]
    impl CredentialStore for RedisCredentialStore {
        async fn verify(&self, nick: &str, password: &str) -> anyhow::Result<bool> {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let stored: Option<String> = conn.hget(&self.key, nick).await?;
            Ok(stored.is_some_and(|p| p == password))
        }
    }
}
