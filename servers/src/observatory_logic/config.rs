use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_observatory::ingestors::GerritSshConfig;
use lib_observatory::{EventStreamConfig, RegistryConfig};

/// `--redis-url` value selecting the in-process store.
pub const MEMORY_STORE: &str = "memory";

const DEFAULT_CONFIG_FILE: &str = "gerrit_observatory.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Gerrit event stream to webhook fan-out", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "OBSERVATORY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "OBSERVATORY_GERRIT_HOST", help = "Gerrit SSH host.")]
    pub gerrit_host: Option<String>,

    #[clap(long, env = "OBSERVATORY_GERRIT_PORT", help = "Gerrit SSH port.")]
    pub gerrit_port: Option<u16>,

    #[clap(long, env = "OBSERVATORY_GERRIT_USER", help = "Gerrit account used to stream events.")]
    pub gerrit_user: Option<String>,

    #[clap(long, env = "OBSERVATORY_PRIVATE_KEY", help = "Private key file for the Gerrit account.")]
    pub private_key: Option<PathBuf>,

    #[clap(long, env = "OBSERVATORY_REDIS_URL", help = "Redis URL of the subscription store, or 'memory'.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "OBSERVATORY_POST_TIMEOUT", help = "Webhook POST timeout in seconds.")]
    pub post_timeout: Option<u64>,

    #[clap(long, env = "OBSERVATORY_HTTP_PORT", help = "Port of the admin HTTP API.")]
    pub http_port: Option<u16>,

    #[clap(long, env = "OBSERVATORY_INBOX_CAPACITY", help = "Queued events per subscriber before drops.")]
    pub inbox_capacity: Option<usize>,

    #[clap(long, env = "OBSERVATORY_QUEUE_CAPACITY", help = "Capacity of the inbound event queue.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "OBSERVATORY_RECONNECT_DELAY_MS", help = "Delay in milliseconds before reconnecting to Gerrit.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "OBSERVATORY_KEEPALIVE_INTERVAL", help = "Seconds between SSH keepalives; 0 disables them.")]
    pub keepalive_interval: Option<u64>,

    #[clap(long, env = "OBSERVATORY_KEEPALIVE_MAX", help = "Unanswered SSH keepalives before reconnecting.")]
    pub keepalive_max: Option<usize>,

    #[clap(long, env = "OBSERVATORY_MAX_EVENT_BYTES", help = "Largest event accepted from the stream, in bytes.")]
    pub max_event_bytes: Option<usize>,

    #[clap(long, env = "OBSERVATORY_DAEMON", help = "Keep reconnecting after connection loss (true/false).")]
    pub daemon: Option<bool>,

    #[clap(long, env = "OBSERVATORY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "OBSERVATORY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            gerrit_host: other.gerrit_host.or(self.gerrit_host),
            gerrit_port: other.gerrit_port.or(self.gerrit_port),
            gerrit_user: other.gerrit_user.or(self.gerrit_user),
            private_key: other.private_key.or(self.private_key),
            redis_url: other.redis_url.or(self.redis_url),
            post_timeout: other.post_timeout.or(self.post_timeout),
            http_port: other.http_port.or(self.http_port),
            inbox_capacity: other.inbox_capacity.or(self.inbox_capacity),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            keepalive_interval: other.keepalive_interval.or(self.keepalive_interval),
            keepalive_max: other.keepalive_max.or(self.keepalive_max),
            max_event_bytes: other.max_event_bytes.or(self.max_event_bytes),
            daemon: other.daemon.or(self.daemon),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn defaults() -> Config {
        Config {
            config_path: None,
            gerrit_host: Some("git.example.com".to_string()),
            gerrit_port: Some(29418),
            gerrit_user: Some("autodeploy".to_string()),
            private_key: Some(PathBuf::from("./.id_rsa")),
            redis_url: Some("redis://127.0.0.1:6379/0".to_string()),
            post_timeout: Some(60),
            http_port: Some(8080),
            inbox_capacity: Some(100),
            queue_capacity: Some(100),
            reconnect_delay_ms: Some(2000),
            keepalive_interval: Some(30),
            keepalive_max: Some(3),
            max_event_bytes: Some(8 * 1024 * 1024),
            daemon: Some(true),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
        }
    }
}

/// Fully resolved settings: every layer merged, every field present.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub gerrit_host: String,
    pub gerrit_port: u16,
    pub gerrit_user: String,
    pub private_key: PathBuf,
    pub redis_url: String,
    pub post_timeout: Duration,
    pub http_port: u16,
    pub inbox_capacity: usize,
    pub queue_capacity: usize,
    pub reconnect_delay: Duration,
    /// `None` when keepalives are disabled.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub max_event_bytes: usize,
    pub daemon: bool,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Settings {
    // Fields the merged layers left unset fall back to the built-in defaults.
    fn from_config(config: Config) -> Settings {
        let d = Config::defaults();
        Settings {
            gerrit_host: config.gerrit_host.or(d.gerrit_host).unwrap_or_default(),
            gerrit_port: config.gerrit_port.or(d.gerrit_port).unwrap_or_default(),
            gerrit_user: config.gerrit_user.or(d.gerrit_user).unwrap_or_default(),
            private_key: config.private_key.or(d.private_key).unwrap_or_default(),
            redis_url: config.redis_url.or(d.redis_url).unwrap_or_default(),
            post_timeout: Duration::from_secs(config.post_timeout.or(d.post_timeout).unwrap_or_default()),
            http_port: config.http_port.or(d.http_port).unwrap_or_default(),
            inbox_capacity: config.inbox_capacity.or(d.inbox_capacity).unwrap_or_default(),
            queue_capacity: config.queue_capacity.or(d.queue_capacity).unwrap_or_default(),
            reconnect_delay: Duration::from_millis(
                config.reconnect_delay_ms.or(d.reconnect_delay_ms).unwrap_or_default(),
            ),
            keepalive_interval: config
                .keepalive_interval
                .or(d.keepalive_interval)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            keepalive_max: config.keepalive_max.or(d.keepalive_max).unwrap_or_default(),
            max_event_bytes: config.max_event_bytes.or(d.max_event_bytes).unwrap_or_default(),
            daemon: config.daemon.or(d.daemon).unwrap_or_default(),
            log_dir: config.log_dir.or(d.log_dir).unwrap_or_default(),
            log_level: config.log_level.or(d.log_level).unwrap_or_default(),
        }
    }

    pub fn gerrit(&self) -> GerritSshConfig {
        GerritSshConfig {
            host: self.gerrit_host.clone(),
            port: self.gerrit_port,
            user: self.gerrit_user.clone(),
            private_key: self.private_key.clone(),
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..GerritSshConfig::default()
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            inbox_capacity: self.inbox_capacity,
            post_timeout: self.post_timeout,
        }
    }

    pub fn event_stream(&self) -> EventStreamConfig {
        EventStreamConfig {
            daemon: self.daemon,
            reconnect_delay: self.reconnect_delay,
            max_event_bytes: self.max_event_bytes,
        }
    }

    /// True when subscriptions live in process memory instead of Redis.
    pub fn uses_memory_store(&self) -> bool {
        self.redis_url.eq_ignore_ascii_case(MEMORY_STORE)
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        tracing::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                tracing::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Merges defaults, then the config file, then environment and CLI.
pub fn resolve(cli: Config) -> Settings {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // clap already folded environment variables into the CLI layer.
    current_config = current_config.merge(cli);
    Settings::from_config(current_config)
}

pub fn load_config() -> Settings {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn missing_file() -> Config {
        Config {
            config_path: Some(PathBuf::from("/nonexistent/gerrit_observatory.conf")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let settings = resolve(missing_file());
        assert_eq!(settings.gerrit_host, "git.example.com");
        assert_eq!(settings.gerrit_port, 29418);
        assert_eq!(settings.gerrit_user, "autodeploy");
        assert_eq!(settings.private_key, PathBuf::from("./.id_rsa"));
        assert_eq!(settings.post_timeout, Duration::from_secs(60));
        assert_eq!(settings.inbox_capacity, 100);
        assert_eq!(settings.queue_capacity, 100);
        assert_eq!(settings.reconnect_delay, Duration::from_millis(2000));
        assert_eq!(settings.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(settings.keepalive_max, 3);
        assert_eq!(settings.max_event_bytes, 8 * 1024 * 1024);
        assert!(settings.daemon);
        assert!(!settings.uses_memory_store());
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"gerritHost": "review.internal", "gerritPort": 2222, "postTimeout": 5, "daemon": false}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            gerrit_port: Some(29419),
            redis_url: Some("memory".to_string()),
            ..Default::default()
        };
        let settings = resolve(cli);
        assert_eq!(settings.gerrit_host, "review.internal");
        assert_eq!(settings.gerrit_port, 29419);
        assert_eq!(settings.post_timeout, Duration::from_secs(5));
        assert!(!settings.daemon);
        assert!(settings.uses_memory_store());
    }

    #[test]
    fn test_zero_keepalive_interval_disables_keepalives() {
        let settings = resolve(Config {
            keepalive_interval: Some(0),
            keepalive_max: Some(5),
            ..missing_file()
        });
        assert_eq!(settings.keepalive_interval, None);
        let gerrit = settings.gerrit();
        assert_eq!(gerrit.keepalive_interval, None);
        assert_eq!(gerrit.keepalive_max, 5);
    }

    #[test]
    fn test_unparsable_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let settings = resolve(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(settings, resolve(missing_file()));
    }

    #[test]
    fn test_engine_configs() {
        let settings = resolve(missing_file());
        assert_eq!(settings.gerrit().command, "gerrit stream-events");
        assert_eq!(settings.gerrit().keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(settings.event_stream().max_event_bytes, 8 * 1024 * 1024);
        assert_eq!(settings.registry().inbox_capacity, 100);
        assert!(settings.event_stream().daemon);
    }
}
