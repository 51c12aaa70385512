use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::store::SqliteStore;
use crate::error::{Result, SyncError};
use crate::sync::cache::StalePolicy;
use crate::sync::pager::{PageLimits, RetryPolicy};

/// Runtime config. Every field has a default so a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// SQLite database. `None` means `<data_dir>/feedsync/feed.db`.
    pub db_path: Option<PathBuf>,
    /// User the CLI acts as.
    pub viewer: String,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub reject_oversized_pages: bool,
    pub stale_after_list_ms: u64,
    pub stale_after_detail_ms: u64,
    pub stale_after_unread_ms: u64,
    /// `None` keeps every entry.
    pub cache_capacity: Option<usize>,
    pub fetch_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: None,
            viewer: String::new(),
            default_page_size: 20,
            max_page_size: 100,
            reject_oversized_pages: false,
            stale_after_list_ms: 30_000,
            stale_after_detail_ms: 30_000,
            stale_after_unread_ms: 15_000,
            cache_capacity: Some(512),
            fetch_timeout_ms: 5_000,
            commit_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            sweep_interval_ms: 60_000,
        }
    }
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedsync")
        .join("config.json")
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

impl Config {
    pub fn load_file() -> Result<Option<Self>> {
        let path = config_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| SyncError::Config(format!("read config: {e}")))?;
        let cfg: Config = serde_json::from_str(&data)
            .map_err(|e| SyncError::Config(format!("parse config: {e}")))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SyncError::Config(format!("create config dir: {e}")))?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("serialize config: {e}")))?;
        fs::write(&path, data).map_err(|e| SyncError::Config(format!("write config: {e}")))
    }

    /// Layer `FEEDSYNC_*` variables over `self`. Unparseable values are
    /// logged and skipped.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! num {
            ($var:literal, $field:expr) => {
                if let Some(v) = lookup($var).and_then(|raw| parse_var($var, &raw)) {
                    $field = v;
                }
            };
        }

        if let Some(path) = lookup("FEEDSYNC_DB") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(viewer) = lookup("FEEDSYNC_VIEWER") {
            self.viewer = viewer;
        }
        if let Some(v) = lookup("FEEDSYNC_STRICT_PAGES") {
            self.reject_oversized_pages = v == "true" || v == "1";
        }
        if let Some(raw) = lookup("FEEDSYNC_CACHE_CAPACITY") {
            if raw.trim().is_empty() || raw.trim() == "0" {
                self.cache_capacity = None;
            } else if let Some(n) = parse_var("FEEDSYNC_CACHE_CAPACITY", &raw) {
                self.cache_capacity = Some(n);
            }
        }
        num!("FEEDSYNC_PAGE_SIZE", self.default_page_size);
        num!("FEEDSYNC_MAX_PAGE_SIZE", self.max_page_size);
        num!("FEEDSYNC_STALE_LIST_MS", self.stale_after_list_ms);
        num!("FEEDSYNC_STALE_DETAIL_MS", self.stale_after_detail_ms);
        num!("FEEDSYNC_STALE_UNREAD_MS", self.stale_after_unread_ms);
        num!("FEEDSYNC_FETCH_TIMEOUT_MS", self.fetch_timeout_ms);
        num!("FEEDSYNC_COMMIT_TIMEOUT_MS", self.commit_timeout_ms);
        num!("FEEDSYNC_RETRY_ATTEMPTS", self.retry_attempts);
        num!("FEEDSYNC_RETRY_DELAY_MS", self.retry_base_delay_ms);
        num!("FEEDSYNC_SWEEP_MS", self.sweep_interval_ms);
    }

    /// Resolution order: env vars → config file → defaults.
    pub fn resolve() -> Result<Self> {
        let mut config = match Self::load_file()? {
            Some(cfg) => {
                log::info!("Config loaded from {}", config_path().display());
                cfg
            }
            None => {
                log::info!("No config file found, using defaults");
                Config::default()
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        if config.max_page_size == 0 {
            return Err(SyncError::Config("max_page_size must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(SqliteStore::default_path)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_size: self.default_page_size,
            max_size: self.max_page_size,
            reject_oversized: self.reject_oversized_pages,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: Duration::from_millis(self.fetch_timeout_ms),
        }
    }

    pub fn stale_policy(&self) -> StalePolicy {
        StalePolicy {
            thread_list: Duration::from_millis(self.stale_after_list_ms),
            thread_detail: Duration::from_millis(self.stale_after_detail_ms),
            unread_count: Duration::from_millis(self.stale_after_unread_ms),
        }
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
