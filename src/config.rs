use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "WIKI_EXTRACT";
pub const DEFAULT_CONFIG_FILE: &str = "wiki_extract.toml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
    #[error("domain must be an http(s) URL, got '{0}'")]
    Domain(String),
}

/// Run settings: defaults, then the optional TOML file, then
/// `WIKI_EXTRACT_*` environment variables, then CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prefix for site-relative links, e.g. `http://wiki.local`.
    pub domain: String,
    /// Index page listing the documents to visit (path or URL).
    pub index: String,
    pub workers: usize,
    pub fetch_workers: usize,
    pub cache_capacity: usize,
    pub doc_queue: usize,
    pub out_queue: usize,
    pub dispatch_queue: usize,
    pub db_path: PathBuf,
    pub retries: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            domain: "http://wiki.local".into(),
            index: "OPI.html".into(),
            workers: 6,
            fetch_workers: 2,
            cache_capacity: 256,
            doc_queue: 2048,
            out_queue: 100,
            dispatch_queue: 64,
            db_path: PathBuf::from("data/wiki.sqlite"),
            retries: 3,
            timeout_secs: 30,
            user_agent: concat!("wiki_extract/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Settings {
    pub fn load(file: &Path) -> Result<Self> {
        let settings: Settings = ::config::Config::builder()
            .add_source(::config::File::from(file).required(false))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .with_context(|| format!("cannot load settings from {:?}", file))?
            .try_deserialize()
            .context("invalid settings")?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("workers", self.workers),
            ("fetch_workers", self.fetch_workers),
            ("cache_capacity", self.cache_capacity),
            ("doc_queue", self.doc_queue),
            ("out_queue", self.out_queue),
            ("dispatch_queue", self.dispatch_queue),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Zero("timeout_secs"));
        }
        if !crate::fetch::is_url(&self.domain) {
            return Err(ConfigError::Domain(self.domain.clone()));
        }
        Ok(())
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
