use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use confer_sfu::{EngineConfig, SfuConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variable overrides (`CONFER_SERVER__PORT=9000`)
const ENV_PREFIX: &str = "CONFER";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted signaling frame, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            // Signaling frames are small; the axum default of 64MB is excessive
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, Self::environment())
    }

    fn load_with(config_file: Option<&str>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(environment);

        builder.build()?.try_deserialize()
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Check the configuration for problems, returning all of them
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be greater than 0".to_string());
        }
        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level is invalid: {}", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }
        if self.sfu.outbound_queue_capacity == 0 {
            errors.push("sfu.outbound_queue_capacity must be greater than 0".to_string());
        }
        if self.engine.announced_ip.is_empty() {
            errors.push("engine.announced_ip must not be empty".to_string());
        }
        if self.engine.rtc_min_port > self.engine.rtc_max_port {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.engine.rtc_min_port, self.engine.rtc_max_port
            ));
        }
        if self.engine.media_codecs.is_empty() {
            errors.push("engine.media_codecs must list at least one codec".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. `--config` command line argument
/// 2. `CONFER_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. Fall back to environment variables only
pub fn load_config(cli_path: Option<&str>) -> Result<Config> {
    let config_path = cli_path
        .map(str::to_string)
        .or_else(|| std::env::var("CONFER_CONFIG_PATH").ok())
        .or_else(|| {
            let cwd = "config.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::load(Some(&path)).with_context(|| format!("Failed to load {path}"))
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::load(None).context("Failed to load config from environment")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::environment().source(Some(map))
    }

    #[test]
    fn test_default_config() {
        let config = Config::load_with(None, env(&[])).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.sfu.outbound_queue_capacity, 256);
        assert!(config.engine.cascade_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        let config = Config::load_with(
            None,
            env(&[
                ("CONFER_SERVER__PORT", "9000"),
                ("CONFER_SFU__MAX_PEERS", "12"),
                ("CONFER_ENGINE__CASCADE_CLOSE", "false"),
                ("CONFER_LOGGING__FORMAT", "json"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sfu.max_peers, 12);
        assert!(!config.engine.cascade_close);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(
            b"server:
  host: 127.0.0.1
  port: 7000
engine:
  rtc_min_port: 50000
  rtc_max_port: 50100
",
        )
        .unwrap();

        let config = Config::load_with(
            Some(path.to_str().unwrap()),
            env(&[("CONFER_SERVER__PORT", "7001")]),
        )
        .unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.engine.rtc_min_port, 50000);
        assert_eq!(config.engine.rtc_max_port, 50100);
        // untouched sections keep their defaults
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.outbound_queue_capacity = 0;
        config.engine.rtc_min_port = 2000;
        config.engine.rtc_max_port = 1000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("rtc_min_port")));
    }
}
