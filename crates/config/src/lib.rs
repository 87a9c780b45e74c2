//! Configuration loading and validation.
//!
//! Sources are layered with `figment`, later sources overriding earlier ones:
//!
//! 1. compiled defaults ([`Config::default`]),
//! 2. a TOML file (explicit path, or `config.toml` in the platform config
//!    directory if it exists),
//! 3. `FOLIO_*` environment variables, nested keys separated by `__`
//!    (`FOLIO_WATCH__DEBOUNCE_MS=500`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FOLIO_";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "folio.db";

/// A configured root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    pub path: PathBuf,
    /// Hidden roots are indexed but flagged so clients can leave them out.
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderCacheConfig {
    /// Upper bound on the number of cached folder snapshots.
    pub max_directories: usize,
    /// Entries evicted per compaction pass. Defaults to 1% of the bound.
    pub compaction_batch: Option<usize>,
}
impl Default for FolderCacheConfig {
    fn default() -> Self {
        Self { max_directories: 2048, compaction_batch: None }
    }
}
impl FolderCacheConfig {
    pub fn compaction_batch(&self) -> usize {
        self.compaction_batch.unwrap_or(self.max_directories / 100).max(1)
    }
}

/// Debounce window plus the hard cap on how long an event may be held back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    pub debounce_ms: u64,
    pub max_delay_ms: u64,
}
impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub scan: usize,
    /// SQLite has a single writer; more than one persist worker only adds contention.
    pub persist: usize,
    pub metadata: usize,
}
impl Default for WorkerConfig {
    fn default() -> Self {
        Self { scan: 4, persist: 1, metadata: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Children reconciled per chunk.
    pub batch_size: usize,
    pub write_lock_timeout_ms: u64,
}
impl Default for SyncConfig {
    fn default() -> Self {
        Self { batch_size: 100, write_lock_timeout_ms: 30_000 }
    }
}
impl SyncConfig {
    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub roots: Vec<RootConfig>,
    /// Output directory that resolves like a root but is never watched or indexed.
    pub cache_dir: Option<PathBuf>,
    /// SQLite database file. Defaults to the platform data directory.
    pub database: Option<PathBuf>,
    pub folder_cache: FolderCacheConfig,
    pub watch: DebounceConfig,
    pub progress: DebounceConfig,
    pub workers: WorkerConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            cache_dir: None,
            database: None,
            folder_cache: FolderCacheConfig::default(),
            watch: DebounceConfig { debounce_ms: 1_000, max_delay_ms: 30_000 },
            progress: DebounceConfig { debounce_ms: 5_000, max_delay_ms: 30_000 },
            workers: WorkerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load from every source and validate.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let figment = Self::figment(file)?.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    /// Defaults plus the TOML file, without the environment layer.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let file = match file {
            Some(path) if !path.is_file() => {
                exn::bail!(ErrorKind::Invalid(format!("config file {} does not exist", path.display())))
            },
            Some(path) => Some(path.to_path_buf()),
            None => Self::project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE)).filter(|p| p.is_file()),
        };
        Ok(match file {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                figment.merge(Toml::file(path))
            },
            None => figment,
        })
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Database file, falling back to the platform data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let dirs = Self::project_dirs().ok_or_raise(|| ErrorKind::Directories)?;
        Ok(dirs.data_dir().join(DATABASE_FILE))
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "folio")
    }

    fn validate(&self) -> Result<()> {
        if self.roots.is_empty() {
            exn::bail!(ErrorKind::Invalid("at least one root directory must be configured".to_string()));
        }
        for root in &self.roots {
            if !root.path.is_absolute() {
                exn::bail!(ErrorKind::Invalid(format!("root {} is not absolute", root.path.display())));
            }
        }
        for (i, a) in self.roots.iter().enumerate() {
            for b in self.roots.iter().skip(i + 1) {
                if a.path.starts_with(&b.path) || b.path.starts_with(&a.path) {
                    exn::bail!(ErrorKind::Invalid(format!(
                        "roots {} and {} overlap",
                        a.path.display(),
                        b.path.display()
                    )));
                }
            }
        }
        if let Some(cache_dir) = &self.cache_dir
            && !cache_dir.is_absolute()
        {
            exn::bail!(ErrorKind::Invalid(format!("cache directory {} is not absolute", cache_dir.display())));
        }
        if self.folder_cache.max_directories == 0 {
            exn::bail!(ErrorKind::Invalid("folder_cache.max_directories must be positive".to_string()));
        }
        if self.workers.scan == 0 || self.workers.persist == 0 || self.workers.metadata == 0 {
            exn::bail!(ErrorKind::Invalid("worker counts must be positive".to_string()));
        }
        if self.sync.batch_size == 0 {
            exn::bail!(ErrorKind::Invalid("sync.batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
