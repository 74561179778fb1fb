//! Configuration loading and root folder resolution
//!
//! Two layers:
//! 1. **Root folder**: where the database and the working directories live.
//!    Resolved by priority: command line, `SEGLOOP_ROOT_FOLDER`, TOML
//!    `root_folder`, OS default.
//! 2. **TOML bootstrap**: port, annotation platform host, nnU-Net locations,
//!    poll policy, logging and extra dataset descriptors. Every key is
//!    optional; a missing file means built-in defaults.

use crate::dataset::DatasetDescriptor;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "SEGLOOP_ROOT_FOLDER";

/// Environment variable naming the TOML configuration file
pub const CONFIG_FILE_ENV: &str = "SEGLOOP_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "segloop.db";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Root folder (optional, see [`RootFolderResolver`])
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL used when handing out slice image links
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Upper bound on an uploaded archive
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Dataset used when neither the request nor case names identify one
    #[serde(default = "default_dataset")]
    pub default_dataset: String,

    #[serde(default)]
    pub cvat: CvatConfig,

    #[serde(default)]
    pub nnunet: NnunetConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Additional dataset descriptors (override built-ins with the same id)
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
}

/// Annotation platform connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct CvatConfig {
    /// Base URL, e.g. `https://app.cvat.ai`
    #[serde(default = "default_cvat_host")]
    pub host: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Export status polling
    #[serde(default)]
    pub poll: PollConfig,
}

/// Backoff policy for the export status poller
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_poll_multiplier")]
    pub multiplier: f64,
    /// Overall deadline for one export
    #[serde(default = "default_poll_deadline_secs")]
    pub deadline_secs: u64,
}

/// nnU-Net tool locations and limits
#[derive(Debug, Clone, Deserialize)]
pub struct NnunetConfig {
    /// `nnUNet_raw` (datasets live under `<raw_dir>/<dataset id>/`)
    #[serde(default)]
    pub raw_dir: Option<PathBuf>,
    /// `nnUNet_preprocessed`
    #[serde(default)]
    pub preprocessed_dir: Option<PathBuf>,
    /// `nnUNet_results`
    #[serde(default)]
    pub results_dir: Option<PathBuf>,

    /// Upper bound on any single nnU-Net process
    #[serde(default = "default_nnunet_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_predict_bin")]
    pub predict_bin: String,
    #[serde(default = "default_plan_bin")]
    pub plan_bin: String,
    #[serde(default = "default_train_bin")]
    pub train_bin: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5328
}

fn default_max_upload_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_dataset() -> String {
    "Dataset001_BrainTumour".to_string()
}

fn default_cvat_host() -> String {
    "https://app.cvat.ai".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_poll_initial_ms() -> u64 {
    500
}

fn default_poll_max_ms() -> u64 {
    8_000
}

fn default_poll_multiplier() -> f64 {
    2.0
}

fn default_poll_deadline_secs() -> u64 {
    300
}

fn default_nnunet_timeout_secs() -> u64 {
    3600
}

fn default_predict_bin() -> String {
    "nnUNetv2_predict".to_string()
}

fn default_plan_bin() -> String {
    "nnUNetv2_plan_and_preprocess".to_string()
}

fn default_train_bin() -> String {
    "nnUNetv2_train".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            bind: default_bind(),
            port: default_port(),
            public_base_url: None,
            max_upload_bytes: default_max_upload_bytes(),
            default_dataset: default_dataset(),
            cvat: CvatConfig::default(),
            nnunet: NnunetConfig::default(),
            logging: LoggingConfig::default(),
            datasets: Vec::new(),
        }
    }
}

impl Default for CvatConfig {
    fn default() -> Self {
        Self {
            host: default_cvat_host(),
            request_timeout_secs: default_request_timeout_secs(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_poll_initial_ms(),
            max_delay_ms: default_poll_max_ms(),
            multiplier: default_poll_multiplier(),
            deadline_secs: default_poll_deadline_secs(),
        }
    }
}

impl Default for NnunetConfig {
    fn default() -> Self {
        Self {
            raw_dir: None,
            preprocessed_dir: None,
            results_dir: None,
            timeout_secs: default_nnunet_timeout_secs(),
            predict_bin: default_predict_bin(),
            plan_bin: default_plan_bin(),
            train_bin: default_train_bin(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TomlConfig {
    /// Load configuration.
    ///
    /// An explicitly named file must exist and parse. Otherwise
    /// `SEGLOOP_CONFIG` and then the per-user config file are tried; if
    /// neither exists the built-in defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            return Self::from_file(Path::new(&path));
        }

        match default_config_file() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => {
                tracing::warn!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

impl NnunetConfig {
    /// `nnUNet_raw`, defaulting to `<root>/nnUNet_raw`
    pub fn raw_dir(&self, root: &Path) -> PathBuf {
        self.raw_dir
            .clone()
            .unwrap_or_else(|| root.join("nnUNet_raw"))
    }

    /// `nnUNet_preprocessed`, defaulting to `<root>/nnUNet_preprocessed`
    pub fn preprocessed_dir(&self, root: &Path) -> PathBuf {
        self.preprocessed_dir
            .clone()
            .unwrap_or_else(|| root.join("nnUNet_preprocessed"))
    }

    /// `nnUNet_results`, defaulting to `<root>/nnUNet_results`
    pub fn results_dir(&self, root: &Path) -> PathBuf {
        self.results_dir
            .clone()
            .unwrap_or_else(|| root.join("nnUNet_results"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. `SEGLOOP_ROOT_FOLDER`
/// 3. TOML `root_folder`
/// 4. OS-dependent default
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_root = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Creates the root folder on first start
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            tracing::info!(path = %self.root_folder.display(), "Creating root folder");
        }
        std::fs::create_dir_all(&self.root_folder).map_err(|e| {
            Error::Config(format!(
                "Cannot create root folder {}: {}",
                self.root_folder.display(),
                e
            ))
        })
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("segloop").join("config.toml"))
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("segloop"))
        .unwrap_or_else(|| PathBuf::from("./segloop_data"))
}
