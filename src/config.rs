//! Configuration loading for the proxy and replay servers.

use crate::error::{ConfigError, ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration tree, loaded from a single TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ServerConfig,
    pub repeater: ServerConfig,
    pub db: DbConfig,
    pub logger: LoggerConfig,
}

/// Shape shared by the proxy and repeater listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds allowed for reading the initial request off a connection.
    pub read_timeout: u64,
    /// Seconds allowed for writing the response back to the client.
    pub write_timeout: u64,
    pub ca_crt: PathBuf,
    pub ca_key: PathBuf,
    pub common_name: String,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub max_connections: u32,
}

impl DbConfig {
    /// Postgres connection string, consumed by `sqlx::postgres::PgPoolOptions`.
    pub fn connect_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.db_name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub encoding: String,
    pub output_paths: Vec<String>,
    pub error_output_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ServerConfig {
                port: 3333,
                common_name: "siphon proxy CA".into(),
                ca_crt: PathBuf::from("./certs/ca-cert.pem"),
                ca_key: PathBuf::from("./certs/ca-key.pem"),
                ..ServerConfig::default()
            },
            repeater: ServerConfig {
                port: 3334,
                common_name: "siphon proxy CA".into(),
                ca_crt: PathBuf::from("./certs/ca-cert.pem"),
                ca_key: PathBuf::from("./certs/ca-key.pem"),
                ..ServerConfig::default()
            },
            db: DbConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            read_timeout: 30,
            write_timeout: 30,
            ca_crt: PathBuf::from("./certs/ca-cert.pem"),
            ca_key: PathBuf::from("./certs/ca-key.pem"),
            common_name: "siphon proxy CA".into(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            password: String::new(),
            db_name: "siphon".into(),
            max_connections: 10,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            encoding: "console".into(),
            output_paths: vec!["stdout".into()],
            error_output_paths: vec!["stderr".into()],
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults if the
    /// file does not exist. A missing config file is not a fatal-startup
    /// condition; only CA and DB failures are.
    pub fn load_from(path: &Path) -> ProxyResult<Self> {
        if path.exists() {
            debug!("loading config from {:?}", path);
            let content = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::NotFound(format!("{}: {}", path.display(), e)))?;

            let config: Config =
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

            Ok(config)
        } else {
            debug!("config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Expand `~` and environment variables in filesystem paths.
    pub fn expand_paths(&mut self) {
        self.proxy.ca_crt = expand_path(&self.proxy.ca_crt);
        self.proxy.ca_key = expand_path(&self.proxy.ca_key);
        self.repeater.ca_crt = expand_path(&self.repeater.ca_crt);
        self.repeater.ca_key = expand_path(&self.repeater.ca_key);
    }

    /// Validate configuration; called once at startup before anything is
    /// bound.
    pub fn validate(&self) -> ProxyResult<()> {
        for (label, server) in [("proxy", &self.proxy), ("repeater", &self.repeater)] {
            if server.port == 0 {
                return Err(ProxyError::InvalidConfig {
                    field: format!("{label}.port"),
                    value: "0".into(),
                    reason: "port must be > 0".into(),
                });
            }
        }

        if self.db.max_connections == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "db.max_connections".into(),
                value: "0".into(),
                reason: "must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Ensure the directories backing the CA certificate/key paths exist.
    pub fn ensure_directories(&self) -> ProxyResult<()> {
        for server in [&self.proxy, &self.repeater] {
            if let Some(parent) = server.ca_crt.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(&path.to_string_lossy());
    PathBuf::from(expanded.as_ref())
}

/// Log a short summary of the effective configuration at startup.
pub fn log_summary(config: &Config) {
    info!(
        proxy_addr = %config.proxy.addr(),
        repeater_addr = %config.repeater.addr(),
        db_host = %config.db.host,
        db_name = %config.db.db_name,
        "configuration loaded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.proxy.port, 3333);
        assert_eq!(config.repeater.port, 3334);
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config.proxy.port, parsed.proxy.port);
        assert_eq!(config.db.max_connections, parsed.db.max_connections);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.proxy.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/siphon.toml")).unwrap();
        assert_eq!(config.proxy.port, 3333);
    }
}
