use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use signal_courier::chat::DEFAULT_API_BASE_URL;
use signal_courier::queue::{BucketSpec, WorkerConfig};
use signal_courier::scheduler::SchedulerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub store: StoreConfig,
    pub telegram: TelegramConfig,
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Literal token, `${ENV_VAR}`, or empty for `TELEGRAM_BOT_TOKEN`.
    pub bot_token: String,
    pub api_base_url: String,
    pub timeout_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub workers: usize,
    pub max_age_secs: u64,
    pub max_attempts: u32,
    pub default_retry_after_secs: u64,
    pub token_poll_interval_ms: u64,
    pub pop_timeout_ms: u64,
    pub recipient_interval_ms: u64,
    pub recipient_deferral_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_age_secs: 300,
            max_attempts: 3,
            default_retry_after_secs: 5,
            token_poll_interval_ms: 33,
            pop_timeout_ms: 1000,
            recipient_interval_ms: 1000,
            recipient_deferral_ms: 1000,
            error_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_sec: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub backlog_report_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            job_timeout_secs: 300,
            backlog_report_interval_secs: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            store: StoreConfig::default(),
            telegram: TelegramConfig::default(),
            delivery: DeliveryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scheduler: SchedulerSection::default(),
        }
    }
}

impl From<&RateLimitConfig> for BucketSpec {
    fn from(config: &RateLimitConfig) -> Self {
        BucketSpec::new(config.capacity, config.refill_per_sec)
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        let delivery = &config.delivery;
        WorkerConfig {
            max_age: Duration::from_secs(delivery.max_age_secs),
            max_attempts: delivery.max_attempts,
            default_retry_after: Duration::from_secs(delivery.default_retry_after_secs),
            token_poll_interval: Duration::from_millis(delivery.token_poll_interval_ms.max(1)),
            pop_timeout: Duration::from_millis(delivery.pop_timeout_ms.max(1)),
            recipient_interval: Duration::from_millis(delivery.recipient_interval_ms),
            recipient_deferral: Duration::from_millis(delivery.recipient_deferral_ms),
            error_backoff: Duration::from_millis(delivery.error_backoff_ms),
            bucket: BucketSpec::from(&config.rate_limit),
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_secs(section.tick_interval_secs.max(1)))
            .with_job_timeout(Duration::from_secs(section.job_timeout_secs.max(1)))
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Backlog report cadence for the `backlog-report` job.
    pub fn backlog_report_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.backlog_report_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.rate_limit.capacity, 30);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.telegram.api_base_url, "https://api.telegram.org");
    }

    #[test]
    fn test_load_explicit_file_with_partial_sections() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_level: debug\nstore:\n  key_prefix: courier\ndelivery:\n  workers: 8\n  max_age_secs: 120\nrate_limit:\n  refill_per_sec: 20\n"
        )
        .unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.store.key_prefix, "courier");
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379/");
        assert_eq!(config.delivery.workers, 8);
        assert_eq!(config.delivery.max_age_secs, 120);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.rate_limit.capacity, 30);
        assert_eq!(config.rate_limit.refill_per_sec, 20.0);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/signal-courier.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "delivery: [not, a, map]").unwrap();
        assert!(Config::load(Some(&file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_worker_config_from_config() {
        let mut config = Config::default();
        config.delivery.max_age_secs = 60;
        config.delivery.token_poll_interval_ms = 0;
        config.rate_limit.capacity = 10;

        let worker = WorkerConfig::from(&config);
        assert_eq!(worker.max_age, Duration::from_secs(60));
        assert_eq!(worker.token_poll_interval, Duration::from_millis(1));
        assert_eq!(worker.bucket, BucketSpec::new(10, 30.0));
        assert_eq!(worker.default_retry_after, Duration::from_secs(5));
    }

    #[test]
    fn test_scheduler_config_from_section() {
        let section = SchedulerSection {
            tick_interval_secs: 10,
            job_timeout_secs: 0,
            backlog_report_interval_secs: 60,
        };
        let scheduler = SchedulerConfig::from(&section);
        assert_eq!(scheduler.tick_interval, Duration::from_secs(10));
        assert_eq!(scheduler.job_timeout, Duration::from_secs(1));
    }
}
