use anyhow::anyhow;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

/// Which backend to open and where.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Cloud project (optionally `project/database`) or file store directory
    /// name.
    #[serde(default = "default_id")]
    pub id: String,
    /// Credentials location for the cloud, base directory for files.
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            id: default_id(),
            location: default_location(),
            retry: RetryConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

/// Transaction retry schedule for the cloud backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// `host:port` of a Datastore emulator; requests then go unauthenticated.
    #[serde(default)]
    pub emulator_host: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            emulator_host: None,
            timeout_secs: default_timeout(),
        }
    }
}

fn default_backend() -> String {
    "file".into()
}

fn default_id() -> String {
    "openfish".into()
}

fn default_location() -> String {
    "./store".into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    50
}

fn default_backoff_max() -> u64 {
    2000
}

fn default_endpoint() -> String {
    "https://datastore.googleapis.com".into()
}

fn default_timeout() -> u64 {
    30
}

pub fn load_default() -> Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    load_from_file(&path)
}

pub fn load_from_file(path: &str) -> Result<AppConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let cfg: AppConfig =
        toml::from_str(&content).with_context(|| format!("parsing {path}"))?;
    Ok(cfg)
}

impl AppConfig {
    /// Loads `CONFIG_PATH` (or `config.toml`) when present, otherwise starts
    /// from defaults, then applies the environment and validates.
    pub fn load_and_validate() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        let mut cfg = if std::path::Path::new(&path).exists() {
            load_from_file(&path)?
        } else {
            AppConfig::default()
        };
        cfg.normalize_and_validate()?;
        Ok(cfg)
    }

    pub fn normalize_and_validate(&mut self) -> Result<()> {
        self.store.normalize_from_env();
        self.store.validate()
    }
}

impl StoreConfig {
    /// `STORE_BACKEND`, `STORE_ID` and `STORE_LOCATION` override the file.
    pub fn normalize_from_env(&mut self) {
        if let Ok(v) = std::env::var("STORE_BACKEND") {
            if !v.trim().is_empty() {
                self.backend = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("STORE_ID") {
            if !v.trim().is_empty() {
                self.id = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("STORE_LOCATION") {
            self.location = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend != "cloud" && self.backend != "file" {
            return Err(anyhow!(
                "store.backend must be \"cloud\" or \"file\", got {:?}",
                self.backend
            ));
        }
        if self.id.trim().is_empty() {
            return Err(anyhow!("store.id is empty; set it in config.toml or STORE_ID"));
        }
        if self.id.matches('/').count() > 1 {
            return Err(anyhow!("store.id must be <project> or <project>/<database>"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("store.retry.max_attempts must be >= 1"));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(anyhow!("store.retry.backoff_max_ms must be >= backoff_base_ms"));
        }
        if self.cloud.timeout_secs == 0 {
            return Err(anyhow!("store.cloud.timeout_secs must be a positive number of seconds"));
        }
        Ok(())
    }
}
