use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 30;

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_username: Option<String>,
    #[serde(default)]
    pub api_password: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    #[serde(default, deserialize_with = "deserialize_country_list")]
    pub favorite_countries: Vec<String>,
    #[serde(default)]
    pub tls_pinned_sha256: Option<String>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_username: None,
            api_password: None,
            refresh_interval_seconds: DEFAULT_REFRESH_INTERVAL_SECONDS,
            favorite_countries: Vec::new(),
            tls_pinned_sha256: None,
            store_path: None,
            request_timeout_seconds: None,
        }
    }
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECONDS
}

/// Accepts either `"us, de"` or `["us", "de"]`.
fn deserialize_country_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CountryList {
        Joined(String),
        Many(Vec<String>),
    }

    let raw = Option::<CountryList>::deserialize(deserializer)?;
    let codes = match raw {
        Some(CountryList::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
        Some(CountryList::Many(codes)) => codes,
        None => Vec::new(),
    };
    Ok(parse_country_codes(codes))
}

pub fn parse_country_codes<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut unique: Vec<String> = Vec::new();
    for code in codes {
        let code = code.as_ref().trim().to_lowercase();
        if !code.is_empty() && !unique.contains(&code) {
            unique.push(code);
        }
    }
    unique
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("exitctl").join("config.json"))
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(_) => Ok(ClientConfig::default()),
    }
}

pub fn save_config(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}
