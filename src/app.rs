use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::utils::{feed_url_from_store, normalize_url};

pub const DEFAULT_TRANSLATE_URL: &str = "http://localhost:5000/translate";

/// Languages offered by the UI. The translation backend may accept more.
pub const SUPPORTED_LANGUAGES: [(&str, &str); 6] = [
    ("en", "English"),
    ("es", "Spanish"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
];

pub fn is_supported_language(code: &str) -> bool {
    SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code)
}

/// Two lowercase ASCII letters.
pub fn is_well_formed_language(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store_url: String,
    pub feed_url: String,
    pub upload_url: String,
    pub translate_url: String,
    pub default_language: String,
    pub request_timeout_secs: u64,
    pub cache_enabled: bool,
    pub log_level: String,
    pub token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_url: String::new(),
            feed_url: String::new(),
            upload_url: String::new(),
            translate_url: DEFAULT_TRANSLATE_URL.to_string(),
            default_language: "en".to_string(),
            request_timeout_secs: 30,
            cache_enabled: true,
            log_level: "info".to_string(),
            token: None,
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("lingo-bridge.toml"))
    }

    /// Load from the default location; a missing or unreadable file yields defaults.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                log::debug!("using default config: {e}");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str::<AppConfig>(&text)?)
    }

    /// `load()` followed by the `LINGO_*` environment overrides.
    pub fn load_with_env() -> Self {
        let mut cfg = Self::load();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    /// `load_from(path)` followed by the `LINGO_*` environment overrides.
    pub fn load_from_with_env(path: &Path) -> Result<Self> {
        Self::load_from_with(path, |key| std::env::var(key).ok())
    }

    fn load_from_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::load_from(path)?;
        cfg.apply_env(lookup);
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("LINGO_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = non_empty("LINGO_TRANSLATE_URL") {
            self.translate_url = v;
        }
        if let Some(v) = non_empty("LINGO_UPLOAD_URL") {
            self.upload_url = v;
        }
    }

    /// Record the bearer token in the config file at `path` (the default
    /// location when `None`). Only the token changes; environment overrides of
    /// the running process are not written back.
    pub fn save_token(token: Option<&str>, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path().ok_or_else(|| Error::Config("no config dir".into()))?,
        };
        let mut stored = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        stored.token = token.map(str::to_string);
        stored.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if normalize_url(&self.store_url).is_empty() {
            return Err(Error::Config("store_url is not set".into()));
        }
        if normalize_url(&self.upload_url).is_empty() {
            return Err(Error::Config("upload_url is not set".into()));
        }
        url::Url::parse(&normalize_url(&self.translate_url))?;
        if !is_well_formed_language(&self.default_language) {
            return Err(Error::Config(format!(
                "default_language {:?} is not a two-letter code",
                self.default_language
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn resolved_feed_url(&self) -> Result<url::Url> {
        if self.feed_url.trim().is_empty() {
            feed_url_from_store(&self.store_url)
        } else {
            Ok(url::Url::parse(self.feed_url.trim())?)
        }
    }
}
