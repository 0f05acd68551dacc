use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;

pub const CACHE_PREFIX: &str = "vpn-controller-";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(300_000);
pub const RECENT_COUNTRIES_KEY: &str = "recent-countries";
pub const MAX_RECENT_COUNTRIES: usize = 5;

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    timestamp: i64,
}

/// Small persistent key/value store shared across invocations of the front-end.
///
/// Every key maps to a string value. Cache entries hold JSON `{data, timestamp}`,
/// `recent-countries` holds a JSON array and `last-server-<code>` holds the server name as-is.
/// There is no locking: each operation reads the file, edits one key and writes it back.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

pub fn default_store_path(profile: &str) -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("exitctl").join(profile).join("store.json"))
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn last_server_key(country: &str) -> String {
    format!("last-server-{}", country)
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&contents) {
            Ok(items) => items,
            Err(err) => {
                log::debug!("ignoring unreadable store {}: {}", self.path.display(), err);
                BTreeMap::new()
            }
        }
    }

    fn save(&self, items: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write store {}", self.path.display()))?;
        Ok(())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.load().remove(key)
    }

    fn set_item(&self, key: &str, value: String) -> Result<()> {
        let mut items = self.load();
        items.insert(key.to_string(), value);
        self.save(&items)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.load();
        if items.remove(key).is_some() {
            self.save(&items)?;
        }
        Ok(())
    }

    pub fn get_cached<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        self.get_cached_at(key, ttl, now_millis())
    }

    /// Reads a cache entry as of `now_ms`; expired entries are removed on the way out.
    pub fn get_cached_at<T: DeserializeOwned>(
        &self,
        key: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Option<T> {
        let full_key = format!("{}{}", CACHE_PREFIX, key);
        let raw = self.get_item(&full_key)?;
        let entry: CacheEntry<T> = serde_json::from_str(&raw).ok()?;
        if now_ms - entry.timestamp > ttl.as_millis() as i64 {
            if let Err(err) = self.remove_item(&full_key) {
                log::warn!("failed to evict cache entry {}: {}", full_key, err);
            }
            return None;
        }
        Some(entry.data)
    }

    pub fn set_cached<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        self.set_cached_at(key, data, now_millis())
    }

    pub fn set_cached_at<T: Serialize>(&self, key: &str, data: &T, now_ms: i64) -> Result<()> {
        let entry = CacheEntry {
            data,
            timestamp: now_ms,
        };
        self.set_item(&format!("{}{}", CACHE_PREFIX, key), serde_json::to_string(&entry)?)
    }

    /// Removes every cache entry; recent countries and last-used servers survive.
    pub fn clear_cache(&self) -> Result<()> {
        let mut items = self.load();
        let before = items.len();
        items.retain(|key, _| !key.starts_with(CACHE_PREFIX));
        if items.len() != before {
            self.save(&items)?;
        }
        Ok(())
    }

    pub fn recent_countries(&self) -> Vec<String> {
        self.get_item(RECENT_COUNTRIES_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn add_recent_country(&self, country: &str) -> Result<()> {
        let mut recent = self.recent_countries();
        recent.retain(|code| code != country);
        recent.insert(0, country.to_string());
        recent.truncate(MAX_RECENT_COUNTRIES);
        self.set_item(RECENT_COUNTRIES_KEY, serde_json::to_string(&recent)?)
    }

    pub fn last_used_server(&self, country: &str) -> Option<String> {
        self.get_item(&last_server_key(country))
            .filter(|server| !server.is_empty())
    }

    pub fn set_last_used_server(&self, country: &str, server: &str) -> Result<()> {
        self.set_item(&last_server_key(country), server.to_string())
    }
}
