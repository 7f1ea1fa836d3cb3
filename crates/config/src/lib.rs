//! Layered configuration: built-in defaults, then an optional file, then
//! `FREEWAY_`-prefixed environment variables (`__` separates nested keys, so
//! `FREEWAY_UPLOAD_QUEUE__RETRIES=5` sets `upload_queue.retries`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::{BaseDirs, ProjectDirs};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FREEWAY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory whose files are tracked as pieces.
    pub watch_directory: PathBuf,
    /// Location of the catalog's JSON document.
    pub metadata_path: PathBuf,
    /// Whether new pieces upload automatically whenever they change.
    pub auto_upload: bool,
    /// Directory kept populated with `<id>-<hash><ext>` links to every clean
    /// piece. Link maintenance is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links_directory: Option<PathBuf>,
    pub watcher_queue: QueueConfig,
    pub upload_queue: QueueConfig,
}

/// Scheduling policy of one operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Settle delay in milliseconds.
    pub delay_ms: u64,
    pub concurrency: usize,
    pub retries: u32,
}

impl QueueConfig {
    pub const WATCHER: Self = Self { delay_ms: 250, concurrency: 20, retries: 2 };
    pub const UPLOAD: Self = Self { delay_ms: 50, concurrency: 10, retries: 2 };

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let root = home_dir().join("freeway");
        Self {
            watch_directory: root.join("files"),
            metadata_path: root.join("metadata.json"),
            auto_upload: false,
            links_directory: None,
            watcher_queue: QueueConfig::WATCHER,
            upload_queue: QueueConfig::UPLOAD,
        }
    }
}

impl Config {
    /// Default location of the config file, if the platform has a config
    /// directory.
    pub fn default_file() -> Option<PathBuf> {
        ProjectDirs::from("", "", "freeway").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit `file` must exist; the default file is optional. The format
    /// follows the file extension.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match file {
            Some(path) => {
                if !path.exists() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = figment.merge(file_provider(path)?);
            },
            None => {
                if let Some(path) = Self::default_file().filter(|path| path.exists()) {
                    tracing::debug!(path = %path.display(), "Using default config file");
                    figment = figment.merge(file_provider(&path)?);
                }
            },
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Extract)?;
        config.validate()
    }

    /// Expand a leading `~` in paths and check values are usable.
    pub fn validate(mut self) -> Result<Self> {
        self.watch_directory = expand_home(&self.watch_directory);
        self.metadata_path = expand_home(&self.metadata_path);
        self.links_directory = self.links_directory.as_deref().map(expand_home);
        if self.watch_directory.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("watch_directory must not be empty".to_string()));
        }
        if self.metadata_path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("metadata_path must not be empty".to_string()));
        }
        for (name, queue) in [("watcher_queue", &self.watcher_queue), ("upload_queue", &self.upload_queue)] {
            if queue.concurrency == 0 {
                exn::bail!(ErrorKind::Invalid(format!("{name}.concurrency must be at least 1")));
            }
        }
        Ok(self)
    }
}

fn file_provider(path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_lowercase);
    let provider = match extension.as_deref() {
        Some("toml") => Figment::from(Toml::file(path)),
        Some("yaml" | "yml") => Figment::from(Yaml::file(path)),
        Some("json") => Figment::from(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    };
    Ok(provider)
}

fn home_dir() -> PathBuf {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()).unwrap_or_else(|| PathBuf::from("."))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
