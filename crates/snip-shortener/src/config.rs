use crate::delete::PipelineSettings;
use clap::{Args, ValueEnum};
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "CONFIG";
pub const BASE_URL_ENV: &str = "BASE_URL";
pub const FILE_STORAGE_PATH_ENV: &str = "FILE_STORAGE_PATH";
pub const DATABASE_DSN_ENV: &str = "DATABASE_DSN";
pub const STORAGE_BACKEND_ENV: &str = "SNIP_STORAGE_BACKEND";
pub const DELETE_WORKERS_ENV: &str = "SNIP_DELETE_WORKERS";
pub const DELETE_RETRY_DELAY_ENV: &str = "SNIP_DELETE_RETRY_DELAY_MS";
pub const DELETE_MAX_ATTEMPTS_ENV: &str = "SNIP_DELETE_MAX_ATTEMPTS";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_DELETE_WORKERS: usize = 3;
pub const DEFAULT_DELETE_RETRY_DELAY_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("storage backend {backend} requires {setting}")]
    Missing {
        backend: StorageBackendArg,
        setting: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendArg {
    #[value(name = "memory")]
    Memory,
    #[value(name = "log")]
    Log,
    #[value(name = "mysql")]
    Mysql,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::Memory => write!(f, "memory"),
            StorageBackendArg::Log => write!(f, "log"),
            StorageBackendArg::Mysql => write!(f, "mysql"),
        }
    }
}

/// Flags and environment variables. Every field is optional so that unset
/// values can fall back to the config file.
#[derive(Debug, Default, Clone, Args)]
pub struct ConfigArgs {
    /// JSON configuration file.
    #[arg(short = 'c', long = "config", env = CONFIG_ENV, global = true)]
    pub config: Option<PathBuf>,

    /// Base address short URLs are rendered under.
    #[arg(short = 'b', long, env = BASE_URL_ENV, global = true)]
    pub base_url: Option<String>,

    /// Append-only log file for the log backend.
    #[arg(short = 'f', long, env = FILE_STORAGE_PATH_ENV, global = true)]
    pub file_storage_path: Option<PathBuf>,

    /// MySQL connection string for the relational backend.
    #[arg(short = 'd', long, env = DATABASE_DSN_ENV, global = true)]
    pub database_dsn: Option<String>,

    /// Storage backend. Inferred from the DSN and file path when unset.
    #[arg(long, env = STORAGE_BACKEND_ENV, value_enum, global = true)]
    pub storage: Option<StorageBackendArg>,

    #[arg(long, env = DELETE_WORKERS_ENV, global = true)]
    pub delete_workers: Option<usize>,

    #[arg(long, env = DELETE_RETRY_DELAY_ENV, global = true)]
    pub delete_retry_delay_ms: Option<u64>,

    /// Give up on a delete batch after this many attempts. Unbounded when unset.
    #[arg(long, env = DELETE_MAX_ATTEMPTS_ENV, global = true)]
    pub delete_max_attempts: Option<u32>,
}

/// Contents of the JSON config file. Unknown keys are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub file_storage_path: Option<PathBuf>,
    pub database_dsn: Option<String>,
    pub storage: Option<StorageBackendArg>,
    pub delete_workers: Option<usize>,
    pub delete_retry_delay_ms: Option<u64>,
    pub delete_max_attempts: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The backend a [`Settings`] resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Log(PathBuf),
    MySql(String),
}

impl Backend {
    pub fn kind(&self) -> StorageBackendArg {
        match self {
            Backend::Memory => StorageBackendArg::Memory,
            Backend::Log(_) => StorageBackendArg::Log,
            Backend::MySql(_) => StorageBackendArg::Mysql,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub backend: Backend,
    pub pipeline: PipelineSettings,
}

impl Settings {
    /// Loads the config file named by `args`, if any, and resolves.
    pub fn load(args: ConfigArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merges flags and environment (already combined in `args`) over `file`,
    /// then applies defaults.
    pub fn resolve(args: ConfigArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let base_url = non_empty(args.base_url)
            .or(non_empty(file.base_url))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let path = args
            .file_storage_path
            .or(file.file_storage_path)
            .filter(|path| !path.as_os_str().is_empty());
        let dsn = non_empty(args.database_dsn).or(non_empty(file.database_dsn));

        let backend = match args.storage.or(file.storage) {
            Some(StorageBackendArg::Memory) => Backend::Memory,
            Some(StorageBackendArg::Log) => Backend::Log(path.ok_or(ConfigError::Missing {
                backend: StorageBackendArg::Log,
                setting: "a file storage path",
            })?),
            Some(StorageBackendArg::Mysql) => Backend::MySql(dsn.ok_or(ConfigError::Missing {
                backend: StorageBackendArg::Mysql,
                setting: "a database dsn",
            })?),
            None => match (dsn, path) {
                (Some(dsn), _) => Backend::MySql(dsn),
                (None, Some(path)) => Backend::Log(path),
                (None, None) => Backend::Memory,
            },
        };

        let workers = args
            .delete_workers
            .or(file.delete_workers)
            .unwrap_or(DEFAULT_DELETE_WORKERS);
        let retry_delay_ms = args
            .delete_retry_delay_ms
            .or(file.delete_retry_delay_ms)
            .unwrap_or(DEFAULT_DELETE_RETRY_DELAY_MS);

        let pipeline = PipelineSettings {
            workers,
            retry_delay: Duration::from_millis(retry_delay_ms),
            max_attempts: args.delete_max_attempts.or(file.delete_max_attempts),
        };

        Ok(Self {
            base_url,
            backend,
            pipeline,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}
