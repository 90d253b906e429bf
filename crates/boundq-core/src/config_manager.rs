use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for boundq
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BoundqConfig {
    /// Queue construction settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Producer/consumer workload used by the demo and throughput runs
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of queued elements, must be > 0
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadConfig {
    #[serde(default = "default_producers")]
    pub producers: usize,

    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Elements pushed by each producer
    #[serde(default = "default_items_per_producer")]
    pub items_per_producer: usize,

    /// Bound for timed pushes, in milliseconds
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// Delay before the coordinator closes the queue, in milliseconds
    #[serde(default = "default_close_after_ms")]
    pub close_after_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            consumers: default_consumers(),
            items_per_producer: default_items_per_producer(),
            push_timeout_ms: default_push_timeout_ms(),
            close_after_ms: default_close_after_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_capacity() -> usize {
    100
}
fn default_producers() -> usize {
    8
}
fn default_consumers() -> usize {
    8
}
fn default_items_per_producer() -> usize {
    15_000
}
fn default_push_timeout_ms() -> u64 {
    100
}
fn default_close_after_ms() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

const LOCAL_CONFIG: &str = ".boundq.toml";

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: BoundqConfig,
    config_path: Option<PathBuf>,
    warnings: Vec<String>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (./.boundq.toml, then ~/.boundq/config.toml)
    /// 3. Defaults
    ///
    /// Nothing is logged while loading, since the subscriber is configured from
    /// the result; call [`ConfigManager::log_summary`] once it is installed.
    pub fn load() -> Result<Self, ConfigError> {
        let warnings = Self::load_dotenv().into_iter().collect();
        let (config, config_path) = Self::load_config_file()?;
        Self::finish(config, config_path, warnings)
    }

    /// Load from an explicit file; a missing file is an error here.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let warnings = Self::load_dotenv().into_iter().collect();
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()), warnings)
    }

    fn finish(
        config: BoundqConfig,
        config_path: Option<PathBuf>,
        mut warnings: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let config =
            Self::apply_env_overrides(config, |key| std::env::var(key).ok(), &mut warnings);
        Self::validate_config(&config)?;

        Ok(Self {
            config,
            config_path,
            warnings,
        })
    }

    /// Report where the configuration came from and every setting that was ignored.
    pub fn log_summary(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }

        match self.config_path {
            Some(ref path) => info!("Config file: {}", path.display()),
            None => info!("Config file: NONE (using defaults)"),
        }
        info!(
            capacity = self.config.queue.capacity,
            producers = self.config.workload.producers,
            consumers = self.config.workload.consumers,
            "Configuration loaded"
        );
    }

    fn load_dotenv() -> Option<String> {
        if Path::new(".env").exists() {
            return dotenv::from_filename(".env")
                .err()
                .map(|e| format!("Failed to load .env file: {}", e));
        }

        let home_env = dirs::home_dir()?.join(".boundq.env");
        if !home_env.exists() {
            return None;
        }
        dotenv::from_path(&home_env)
            .err()
            .map(|e| format!("Failed to load .boundq.env: {}", e))
    }

    fn load_config_file() -> Result<(BoundqConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(LOCAL_CONFIG);
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((BoundqConfig::default(), None))
    }

    /// `~/.boundq/config.toml`, when a home directory is known
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".boundq").join("config.toml"))
    }

    fn read_toml_file(path: &Path) -> Result<BoundqConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `BOUNDQ_*` overrides; unparsable numbers are skipped and recorded in `warnings`.
    fn apply_env_overrides<F>(
        mut config: BoundqConfig,
        var: F,
        warnings: &mut Vec<String>,
    ) -> BoundqConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<N: std::str::FromStr>(
            var: &impl Fn(&str) -> Option<String>,
            key: &str,
            warnings: &mut Vec<String>,
        ) -> Option<N> {
            let raw = var(key)?;
            match raw.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warnings.push(format!("Ignoring {}={:?}: not a number", key, raw));
                    None
                }
            }
        }

        if let Some(n) = parsed(&var, "BOUNDQ_CAPACITY", warnings) {
            config.queue.capacity = n;
        }
        if let Some(n) = parsed(&var, "BOUNDQ_PRODUCERS", warnings) {
            config.workload.producers = n;
        }
        if let Some(n) = parsed(&var, "BOUNDQ_CONSUMERS", warnings) {
            config.workload.consumers = n;
        }
        if let Some(n) = parsed(&var, "BOUNDQ_ITEMS_PER_PRODUCER", warnings) {
            config.workload.items_per_producer = n;
        }
        if let Some(ms) = parsed(&var, "BOUNDQ_PUSH_TIMEOUT_MS", warnings) {
            config.workload.push_timeout_ms = ms;
        }
        if let Some(ms) = parsed(&var, "BOUNDQ_CLOSE_AFTER_MS", warnings) {
            config.workload.close_after_ms = ms;
        }
        if let Some(level) = var("BOUNDQ_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = var("BOUNDQ_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate_config(config: &BoundqConfig) -> Result<(), ConfigError> {
        if config.queue.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Queue capacity must be greater than zero".to_string(),
            ));
        }

        if config.workload.producers == 0 || config.workload.consumers == 0 {
            return Err(ConfigError::ValidationError(
                "Workload needs at least one producer and one consumer".to_string(),
            ));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &BoundqConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Problems found while loading that did not stop it, such as ignored overrides
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = BoundqConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = BoundqConfig::default();
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.workload.producers, 8);
        assert_eq!(config.workload.items_per_producer, 15_000);
        assert_eq!(config.logging.level, "info");
        assert!(ConfigManager::validate_config(&config).is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = BoundqConfig::default();

        let mut zero = config.clone();
        zero.queue.capacity = 0;
        assert!(ConfigManager::validate_config(&zero).is_err());

        let mut no_consumers = config.clone();
        no_consumers.workload.consumers = 0;
        assert!(ConfigManager::validate_config(&no_consumers).is_err());

        let mut bad_level = config.clone();
        bad_level.logging.level = "loud".to_string();
        assert!(ConfigManager::validate_config(&bad_level).is_err());

        let mut bad_format = config;
        bad_format.logging.format = "xml".to_string();
        assert!(ConfigManager::validate_config(&bad_format).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BOUNDQ_CAPACITY", "5"),
            ("BOUNDQ_CONSUMERS", "2"),
            ("BOUNDQ_PRODUCERS", "many"),
            ("BOUNDQ_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut warnings = Vec::new();
        let config = ConfigManager::apply_env_overrides(
            BoundqConfig::default(),
            |key| env.get(key).map(|v| v.to_string()),
            &mut warnings,
        );
        assert_eq!(config.queue.capacity, 5);
        assert_eq!(config.workload.consumers, 2);
        assert_eq!(config.workload.producers, 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            warnings,
            vec!["Ignoring BOUNDQ_PRODUCERS=\"many\": not a number".to_string()]
        );
    }

    #[test]
    fn test_ignored_override_is_logged_after_load() {
        let mut warnings = Vec::new();
        let config = ConfigManager::apply_env_overrides(
            BoundqConfig::default(),
            |key| (key == "BOUNDQ_PRODUCERS").then(|| "many".to_string()),
            &mut warnings,
        );
        let manager = ConfigManager {
            config,
            config_path: None,
            warnings,
        };
        assert_eq!(manager.warnings().len(), 1);

        let logs = capture_logs(|| manager.log_summary());
        assert!(logs.contains("WARN"), "logs: {}", logs);
        assert!(logs.contains("Ignoring BOUNDQ_PRODUCERS=\"many\""), "logs: {}", logs);
        assert!(logs.contains("Config file: NONE (using defaults)"), "logs: {}", logs);
        assert!(logs.contains("Configuration loaded"), "logs: {}", logs);
    }

    fn capture_logs<F>(f: F) -> String
    where
        F: FnOnce(),
    {
        use std::io::Write;
        use std::sync::{Arc, Mutex};
        use tracing::subscriber::with_default;
        use tracing_subscriber::EnvFilter;

        #[derive(Clone)]
        struct BufferWriter {
            inner: Arc<Mutex<Vec<u8>>>,
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for BufferWriter {
            type Writer = BufferGuard;

            fn make_writer(&'a self) -> Self::Writer {
                BufferGuard {
                    inner: self.inner.clone(),
                }
            }
        }

        struct BufferGuard {
            inner: Arc<Mutex<Vec<u8>>>,
        }

        impl Write for BufferGuard {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.inner.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let writer = BufferWriter {
            inner: Arc::new(Mutex::new(Vec::new())),
        };
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_ansi(false)
            .without_time()
            .with_writer(writer.clone())
            .finish();

        with_default(subscriber, f);

        let bytes = writer.inner.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BoundqConfig = toml::from_str("[queue]\ncapacity = 7\n").unwrap();
        assert_eq!(config.queue.capacity, 7);
        assert_eq!(config.workload, WorkloadConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
