use clap::Parser;
use neocortex::configs::NeocortexSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default size of the PostgreSQL pool.
pub const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "NEOCORTEX signal bus server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PORT", help = "HTTP port to listen on.")]
    pub port: Option<u16>,

    #[clap(long, env = "NEOCORTEX_SERVER_CONFIG", help = "Path to the JSON server configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "NEOCORTEX_CONFIG", help = "Path to the JSON settings of the nervous system (clock, relay, mailer).")]
    pub settings_path: Option<PathBuf>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL. In-memory store when absent.")]
    pub database_url: Option<String>,

    #[clap(long, env = "DATABASE_POOL_SIZE", help = "Maximum PostgreSQL connections.")]
    pub pool_size: Option<usize>,

    #[clap(long, env = "REDIS_URL", help = "Redis URL. In-process relay when absent.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "NEOCORTEX_LOG_PREFIX", help = "File name prefix of the rolling log.")]
    pub log_prefix: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            settings_path: other.settings_path.or(self.settings_path),
            database_url: other.database_url.or(self.database_url),
            pool_size: other.pool_size.or(self.pool_size),
            redis_url: other.redis_url.or(self.redis_url),
            log_prefix: other.log_prefix.or(self.log_prefix),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(DEFAULT_POOL_SIZE).max(1)
    }

    /// Non-empty database URL, if any.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Non-empty Redis URL, if any.
    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Settings of the nervous system: the settings file when readable,
    /// defaults otherwise, with the mail environment applied on top.
    pub fn neocortex_settings(&self) -> NeocortexSettings {
        let settings = match &self.settings_path {
            Some(path) if path.exists() => match NeocortexSettings::from_file(path) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to load settings {}: {}. Using defaults.", path.display(), e);
                    NeocortexSettings::default()
                }
            },
            Some(path) => {
                info!("Settings file not found at {}. Using defaults.", path.display());
                NeocortexSettings::default()
            }
            None => NeocortexSettings::default(),
        };
        settings.with_mail_env()
    }
}

fn defaults() -> Config {
    Config {
        port: Some(DEFAULT_PORT),
        pool_size: Some(DEFAULT_POOL_SIZE),
        log_prefix: Some("server_neocortex".to_string()),
        ..Default::default()
    }
}

/// Defaults, then the JSON file named by `config_path` (or
/// `server_neocortex.conf`), then CLI arguments and environment variables.
pub fn load_config() -> Config {
    load_config_with(Config::parse())
}

pub fn load_config_with(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_neocortex.conf"));

    let mut current_config = defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_sources() {
        let config = load_config_with(Config {
            config_path: Some(PathBuf::from("/nonexistent/server_neocortex.conf")),
            ..Default::default()
        });
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.pool_size(), DEFAULT_POOL_SIZE);
        assert_eq!(config.log_prefix.as_deref(), Some("server_neocortex"));
        assert!(config.database_url().is_none());
    }

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 8080, "redisUrl": "redis://cache:6379", "poolSize": 4}}"#).unwrap();

        let config = load_config_with(Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(9090),
            ..Default::default()
        });
        assert_eq!(config.port(), 9090);
        assert_eq!(config.redis_url(), Some("redis://cache:6379"));
        assert_eq!(config.pool_size(), 4);
    }

    #[test]
    fn blank_urls_select_in_memory_backends() {
        let config = Config {
            database_url: Some("  ".to_string()),
            redis_url: Some(String::new()),
            ..Default::default()
        };
        assert!(config.database_url().is_none());
        assert!(config.redis_url().is_none());
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let config = Config {
            settings_path: Some(PathBuf::from("/nonexistent/neocortex.json")),
            ..Default::default()
        };
        assert_eq!(config.neocortex_settings().channel, "notifications");
    }
}
