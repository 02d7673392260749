use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {message}")]
    Parse { path: String, message: String },
    #[error("Failed to load config from environment: {0}")]
    Env(String),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Postgres URL, or `memory` for an in-process store.
    pub database_url: String,
    pub jwt_secret: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_bot_memory_mb")]
    pub default_bot_memory_mb: i64,

    #[serde(default = "default_worker_memory_mb")]
    pub default_worker_memory_mb: i64,

    #[serde(default = "default_worker_agent_port")]
    pub worker_agent_port: u16,

    #[serde(default = "default_orchestration_timeout_secs")]
    pub orchestration_timeout_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_pnl_lookup_timeout_secs")]
    pub pnl_lookup_timeout_secs: u64,

    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    #[serde(default = "default_binance_base_url")]
    pub binance_base_url: String,

    #[serde(default)]
    pub binance_api_key: Option<String>,

    #[serde(default)]
    pub binance_api_secret: Option<String>,

    #[serde(default = "default_bot_image")]
    pub bot_image: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    database_url: Option<String>,
    jwt_secret: Option<String>,
    listen_addr: Option<String>,
    log_dir: Option<String>,
    default_bot_memory_mb: Option<i64>,
    default_worker_memory_mb: Option<i64>,
    worker_agent_port: Option<u16>,
    orchestration_timeout_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
    miss_threshold: Option<u32>,
    heartbeat_timeout_secs: Option<u64>,
    pnl_lookup_timeout_secs: Option<u64>,
    subscriber_buffer: Option<usize>,
    binance_base_url: Option<String>,
    binance_api_key: Option<String>,
    binance_api_secret: Option<String>,
    bot_image: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_bot_memory_mb() -> i64 {
    110
}

fn default_worker_memory_mb() -> i64 {
    550
}

fn default_worker_agent_port() -> u16 {
    8001
}

fn default_orchestration_timeout_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_pnl_lookup_timeout_secs() -> u64 {
    5
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_binance_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_bot_image() -> String {
    "trading-bot:latest".to_string()
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let file_config = match config_path {
            Some(path) => Self::read_file(Path::new(path))?,
            None => PartialServerConfig::default(),
        };
        let env_config: PartialServerConfig =
            envy::from_env::<PartialServerConfig>().map_err(|e| ConfigError::Env(e.to_string()))?;

        Self::merge(env_config, file_config)
    }

    fn read_file(path: &Path) -> Result<PartialServerConfig, ConfigError> {
        if !path.exists() {
            return Ok(PartialServerConfig::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Environment overrides file; file overrides defaults.
    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Result<Self, ConfigError> {
        let config = ServerConfig {
            database_url: env
                .database_url
                .or(file.database_url)
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            jwt_secret: env.jwt_secret.or(file.jwt_secret).ok_or(ConfigError::Missing("JWT_SECRET"))?,
            listen_addr: env.listen_addr.or(file.listen_addr).unwrap_or_else(default_listen_addr),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            default_bot_memory_mb: env
                .default_bot_memory_mb
                .or(file.default_bot_memory_mb)
                .unwrap_or_else(default_bot_memory_mb),
            default_worker_memory_mb: env
                .default_worker_memory_mb
                .or(file.default_worker_memory_mb)
                .unwrap_or_else(default_worker_memory_mb),
            worker_agent_port: env
                .worker_agent_port
                .or(file.worker_agent_port)
                .unwrap_or_else(default_worker_agent_port),
            orchestration_timeout_secs: env
                .orchestration_timeout_secs
                .or(file.orchestration_timeout_secs)
                .unwrap_or_else(default_orchestration_timeout_secs),
            reconcile_interval_secs: env
                .reconcile_interval_secs
                .or(file.reconcile_interval_secs)
                .unwrap_or_else(default_reconcile_interval_secs),
            poll_timeout_secs: env
                .poll_timeout_secs
                .or(file.poll_timeout_secs)
                .unwrap_or_else(default_poll_timeout_secs),
            miss_threshold: env
                .miss_threshold
                .or(file.miss_threshold)
                .unwrap_or_else(default_miss_threshold),
            heartbeat_timeout_secs: env
                .heartbeat_timeout_secs
                .or(file.heartbeat_timeout_secs)
                .unwrap_or_else(default_heartbeat_timeout_secs),
            pnl_lookup_timeout_secs: env
                .pnl_lookup_timeout_secs
                .or(file.pnl_lookup_timeout_secs)
                .unwrap_or_else(default_pnl_lookup_timeout_secs),
            subscriber_buffer: env
                .subscriber_buffer
                .or(file.subscriber_buffer)
                .unwrap_or_else(default_subscriber_buffer),
            binance_base_url: env
                .binance_base_url
                .or(file.binance_base_url)
                .unwrap_or_else(default_binance_base_url),
            binance_api_key: env.binance_api_key.or(file.binance_api_key),
            binance_api_secret: env.binance_api_secret.or(file.binance_api_secret),
            bot_image: env.bot_image.or(file.bot_image).unwrap_or_else(default_bot_image),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "miss_threshold",
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_bot_memory_mb <= 0 || self.default_worker_memory_mb <= 0 {
            return Err(ConfigError::Invalid {
                key: "default_bot_memory_mb",
                message: "memory defaults must be positive".to_string(),
            });
        }
        for (key, secs) in [
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("poll_timeout_secs", self.poll_timeout_secs),
            ("orchestration_timeout_secs", self.orchestration_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be at least 1 second".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }

    pub fn orchestration_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn pnl_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.pnl_lookup_timeout_secs)
    }
}
