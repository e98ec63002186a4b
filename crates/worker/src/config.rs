//! Worker configuration (command-line flags or `RELAY_*` environment
//! variables).

use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use relay_observability::LogFormat;

use crate::duration::parse_duration;
use crate::executor::BackendKind;
use crate::processor::ProcessorConfig;

/// Smallest lock TTL for which `TTL / 2` is still a usable renewal period.
const MIN_LOCK_TTL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("lock TTL must be at least {min:?}, got {got:?}")]
    LockTtlTooShort { min: Duration, got: Duration },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("database max connections must be greater than zero")]
    NoDatabaseConnections,

    #[error("consumer name must not be empty")]
    EmptyConsumerName,
}

/// Where job ids come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConsumerMode {
    /// Consume the Redis stream through the consumer group.
    #[default]
    Broker,
    /// Scan the repository for pending jobs on an interval.
    Polling,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "relay-worker", version, about = "Durable job execution worker")]
pub struct WorkerConfig {
    /// Postgres connection string.
    #[arg(long, env = "RELAY_DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "RELAY_DB_MAX_CONNECTIONS", default_value_t = 25)]
    pub db_max_connections: u32,

    /// Redis URL used for both locks and the job stream.
    #[arg(long, env = "RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Stream (topic) carrying job ids.
    #[arg(long, env = "RELAY_STREAM_KEY", default_value = "relay-jobs")]
    pub stream_key: String,

    #[arg(long, env = "RELAY_CONSUMER_GROUP", default_value = "relay-worker-group")]
    pub consumer_group: String,

    /// Name inside the consumer group; also stored as the lock value.
    /// Defaults to `worker-<pid>`.
    #[arg(long, env = "RELAY_CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    #[arg(long, env = "RELAY_LOCK_TTL", default_value = "10m", value_parser = parse_duration)]
    pub lock_ttl: Duration,

    /// Renew held locks every TTL/2 while a job runs.
    #[arg(long, env = "RELAY_USE_WATCHDOG", default_value_t = true, action = ArgAction::Set)]
    pub use_watchdog: bool,

    /// Deadline for jobs without a positive `timeout_seconds`.
    #[arg(long, env = "RELAY_DEFAULT_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub default_timeout: Duration,

    #[arg(long, env = "RELAY_MODE", value_enum, default_value_t = ConsumerMode::Broker)]
    pub mode: ConsumerMode,

    /// Scan interval in polling mode.
    #[arg(long, env = "RELAY_POLL_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    #[arg(long, env = "RELAY_EXECUTOR", value_enum, default_value_t = BackendKind::Simulated)]
    pub executor: BackendKind,

    /// How long one broker read blocks waiting for new messages.
    #[arg(long, env = "RELAY_READ_BLOCK", default_value = "1s", value_parser = parse_duration)]
    pub read_block: Duration,

    /// Pause after a failed broker read.
    #[arg(long, env = "RELAY_READ_ERROR_BACKOFF", default_value = "1s", value_parser = parse_duration)]
    pub read_error_backoff: Duration,

    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl < MIN_LOCK_TTL {
            return Err(ConfigError::LockTtlTooShort {
                min: MIN_LOCK_TTL,
                got: self.lock_ttl,
            });
        }
        for (name, value) in [
            ("default timeout", self.default_timeout),
            ("poll interval", self.poll_interval),
            ("read block", self.read_block),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::NoDatabaseConnections);
        }
        if self
            .consumer_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(ConfigError::EmptyConsumerName);
        }
        Ok(())
    }

    pub fn consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default()
            .with_lock_ttl(self.lock_ttl)
            .with_watchdog(self.use_watchdog)
            .with_default_timeout(self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> WorkerConfig {
        let mut argv = vec!["relay-worker", "--database-url", "postgres://localhost/relay"];
        argv.extend_from_slice(args);
        WorkerConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_worker_flags() {
        let config = parse(&[]);
        assert_eq!(config.stream_key, "relay-jobs");
        assert_eq!(config.consumer_group, "relay-worker-group");
        assert_eq!(config.lock_ttl, Duration::from_secs(600));
        assert!(config.use_watchdog);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.mode, ConsumerMode::Broker);
        assert_eq!(config.executor, BackendKind::Simulated);
        assert_eq!(config.db_max_connections, 25);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
        assert!(config.consumer_name().starts_with("worker-"));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--lock-ttl",
            "2s",
            "--use-watchdog",
            "false",
            "--mode",
            "polling",
            "--executor",
            "shell",
            "--consumer-name",
            "w1",
            "--log-format",
            "pretty",
        ]);
        assert_eq!(config.lock_ttl, Duration::from_secs(2));
        assert!(!config.use_watchdog);
        assert_eq!(config.mode, ConsumerMode::Polling);
        assert_eq!(config.executor, BackendKind::Shell);
        assert_eq!(config.consumer_name(), "w1");

        let processor = config.processor_config();
        assert_eq!(processor.lock_ttl, Duration::from_secs(2));
        assert!(!processor.use_watchdog);
    }

    #[test]
    fn rejects_tiny_lock_ttl() {
        let config = parse(&["--lock-ttl", "1ms"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LockTtlTooShort { .. })
        ));
    }

    #[test]
    fn rejects_bad_duration_strings() {
        let argv = [
            "relay-worker",
            "--database-url",
            "postgres://localhost/relay",
            "--lock-ttl",
            "ten minutes",
        ];
        assert!(WorkerConfig::try_parse_from(argv).is_err());
    }

    #[test]
    fn database_url_is_required() {
        if std::env::var_os("RELAY_DATABASE_URL").is_none() {
            assert!(WorkerConfig::try_parse_from(["relay-worker"]).is_err());
        }
    }
}
