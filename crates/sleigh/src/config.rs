//! Effective configuration for the `sleigh` binary (spec §6).
//!
//! Layered as: built-in defaults -> optional TOML file (`--config`, default
//! `sleigh.toml` if present) -> environment variables prefixed `SLEIGH_`
//! with `__` as the nesting separator. `dotenvy` loads a `.env` file before
//! the environment layer is read. Validation happens once, in
//! [`AppConfig::validate`], before any subscriber, the Store, or any other
//! I/O is opened (spec §7: "Configuration invalid at startup: fatal; exit
//! before any subscriber starts").

use chrono::NaiveDate;
use serde::Deserialize;
use source_a::TopicSubscription;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Raised by [`AppConfig::validate`] or by loading itself. Always fatal
/// (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceAAppConfig {
    pub broker: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub qos: u8,
    pub keepalive_secs: u64,
    /// `pattern:table:desc;pattern:table:desc;...` (spec §6).
    pub topics: String,
}

impl Default for SourceAAppConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_owned(),
            port: 1883,
            user: None,
            pass: None,
            qos: 1,
            keepalive_secs: 60,
            topics: String::new(),
        }
    }
}

impl SourceAAppConfig {
    /// Parses `topics` into individual subscriptions. Malformed entries
    /// (missing `table` or `desc`) are rejected during validation, not here.
    pub fn parse_topics(&self) -> Result<Vec<TopicSubscription>, ConfigError> {
        self.topics
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut parts = entry.splitn(3, ':');
                let pattern = parts.next().unwrap_or_default().trim();
                let table = parts.next().unwrap_or_default().trim();
                let description = parts.next().unwrap_or_default().trim();
                if pattern.is_empty() || table.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "malformed source_a.topics entry (expected pattern:table:desc): {entry}"
                    )));
                }
                Ok(TopicSubscription {
                    pattern: pattern.to_owned(),
                    table: table.to_owned(),
                    description: description.to_owned(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceBAppConfig {
    pub id: String,
    pub secret: String,
    /// Comma-separated device ids reporting temperature + humidity.
    pub devices_air: String,
    /// Comma-separated device ids reporting temperature only.
    pub devices_water: String,
    /// HTTPS endpoint exchanging `{uaid, secret}` for a bearer token.
    pub token_url: String,
    /// WebSocket endpoint streaming device events once authenticated.
    pub stream_url: String,
}

impl Default for SourceBAppConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            devices_air: String::new(),
            devices_water: String::new(),
            token_url: "https://cloud.example.invalid/auth/token".to_owned(),
            stream_url: "wss://cloud.example.invalid/stream".to_owned(),
        }
    }
}

impl SourceBAppConfig {
    fn split_devices(raw: &str) -> Vec<String> {
        raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect()
    }

    #[must_use]
    pub fn air_devices(&self) -> Vec<String> {
        Self::split_devices(&self.devices_air)
    }

    #[must_use]
    pub fn water_devices(&self) -> Vec<String> {
        Self::split_devices(&self.devices_water)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreAppConfig {
    pub path: PathBuf,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    /// Hard floor: writes fail with `StorageFull` once free space on the
    /// store's filesystem drops below this many bytes (spec §4.1).
    pub free_space_floor_bytes: u64,
    /// Checkpoints are delayed until the write-ahead region exceeds this
    /// size, to minimize write amplification on slow storage (spec §4.1).
    pub checkpoint_threshold_bytes: u64,
}

impl Default for StoreAppConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data_sleigh.db"),
            batch_size: 5_000,
            flush_interval_secs: 300,
            free_space_floor_bytes: 64 * 1024 * 1024,
            checkpoint_threshold_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeasonAppConfig {
    /// `YYYY-MM-DD`, inclusive.
    pub start: String,
    /// `YYYY-MM-DD`, exclusive.
    pub end: String,
}

impl Default for SeasonAppConfig {
    fn default() -> Self {
        Self { start: "2024-11-01".to_owned(), end: "2025-03-01".to_owned() }
    }
}

impl SeasonAppConfig {
    pub fn parse(&self) -> Result<domain::SeasonConfig, ConfigError> {
        let start = NaiveDate::parse_from_str(&self.start, "%Y-%m-%d")
            .map_err(|e| ConfigError::Invalid(format!("season.start: {e}")))?;
        let end = NaiveDate::parse_from_str(&self.end, "%Y-%m-%d")
            .map_err(|e| ConfigError::Invalid(format!("season.end: {e}")))?;
        if end <= start {
            return Err(ConfigError::Invalid("season.end must be after season.start".to_owned()));
        }
        Ok(domain::SeasonConfig { start, end })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishAppConfig {
    pub bucket: String,
    pub key: String,
    pub backup_prefix: String,
    pub aws_key: Option<String>,
    pub aws_secret: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub interval_seconds: u64,
    pub minutes_of_data: u32,
    pub replay_delay_seconds: u64,
    pub max_consecutive_failures: u32,
    pub empty_threshold: f64,
    pub min_goodness_r2: f64,
    pub min_segment_len: usize,
    pub min_points: usize,
    pub jump_threshold: f64,
}

impl Default for PublishAppConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key: "live.json.gz".to_owned(),
            backup_prefix: "backups".to_owned(),
            aws_key: None,
            aws_secret: None,
            region: "us-east-1".to_owned(),
            endpoint: None,
            interval_seconds: 30,
            minutes_of_data: 10,
            replay_delay_seconds: 300,
            max_consecutive_failures: 10,
            empty_threshold: 50.0,
            min_goodness_r2: 0.4,
            min_segment_len: 3,
            min_points: 5,
            jump_threshold: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackupAppConfig {
    pub day_of_month: u32,
    pub hour: u32,
}

impl Default for BackupAppConfig {
    fn default() -> Self {
        Self { day_of_month: 1, hour: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertAppConfig {
    pub email_to: String,
    pub smtp_host: String,
    pub smtp_port: Option<u16>,
    pub smtp_tls: Option<bool>,
    pub smtp_from: String,
    pub db_size_mb: u64,
    pub free_space_mb: u64,
    pub cooldown_hours: u64,
}

impl Default for AlertAppConfig {
    fn default() -> Self {
        Self {
            email_to: String::new(),
            smtp_host: String::new(),
            smtp_port: None,
            smtp_tls: None,
            smtp_from: "data-sleigh@localhost".to_owned(),
            db_size_mb: 4096,
            free_space_mb: 512,
            cooldown_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SupervisorAppConfig {
    /// Bound on Supervisor-level restarts of a subscriber task that exits
    /// with a hard error, distinct from each subscriber's own internal
    /// reconnect-with-backoff (spec §9 supplement; see `SPEC_FULL.md` §4).
    pub max_task_restarts: u32,
    pub shutdown_deadline_secs: u64,
}

impl Default for SupervisorAppConfig {
    fn default() -> Self {
        Self { max_task_restarts: 5, shutdown_deadline_secs: 30 }
    }
}

/// Full effective configuration, covering every row of spec.md §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source_a: SourceAAppConfig,
    pub source_b: SourceBAppConfig,
    pub store: StoreAppConfig,
    pub season: SeasonAppConfig,
    pub publish: PublishAppConfig,
    pub backup: BackupAppConfig,
    pub alert: AlertAppConfig,
    pub supervisor: SupervisorAppConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_a: SourceAAppConfig::default(),
            source_b: SourceBAppConfig::default(),
            store: StoreAppConfig::default(),
            season: SeasonAppConfig::default(),
            publish: PublishAppConfig::default(),
            backup: BackupAppConfig::default(),
            alert: AlertAppConfig::default(),
            supervisor: SupervisorAppConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load layered configuration: defaults -> optional TOML file -> env
    /// (`SLEIGH_` prefix, `__` nesting separator). Call [`Self::validate`]
    /// on the result before using it for anything.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file or environment cannot be
    /// parsed into `AppConfig`'s shape.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let default_path = PathBuf::from("sleigh.toml");
        let file_path = config_path.map(Path::to_path_buf).unwrap_or(default_path);
        let file_required = config_path.is_some();

        let builder = config::Config::builder()
            .add_source(config::File::from(file_path).required(file_required))
            .add_source(config::Environment::with_prefix("SLEIGH").separator("__"));

        let raw = builder.build()?;
        Ok(raw.try_deserialize()?)
    }

    /// Validate the effective configuration. Fatal on failure; must run
    /// before any subscriber, the Store, or any other I/O is opened
    /// (spec §7).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] with a human-readable reason.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_a.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("source_a.broker must not be empty".to_owned()));
        }
        if self.source_a.qos > 2 {
            return Err(ConfigError::Invalid("source_a.qos must be 0, 1 or 2".to_owned()));
        }
        if self.source_a.parse_topics()?.is_empty() {
            return Err(ConfigError::Invalid("source_a.topics must declare at least one pattern".to_owned()));
        }

        if self.source_b.id.trim().is_empty() || self.source_b.secret.trim().is_empty() {
            return Err(ConfigError::Invalid("source_b.id and source_b.secret must not be empty".to_owned()));
        }
        if self.source_b.air_devices().is_empty() && self.source_b.water_devices().is_empty() {
            return Err(ConfigError::Invalid("source_b must declare at least one device id".to_owned()));
        }
        if self.source_b.token_url.trim().is_empty() || self.source_b.stream_url.trim().is_empty() {
            return Err(ConfigError::Invalid("source_b.token_url and source_b.stream_url must not be empty".to_owned()));
        }

        if self.store.batch_size == 0 {
            return Err(ConfigError::Invalid("store.batch_size must be positive".to_owned()));
        }
        if self.store.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("store.flush_interval must be positive".to_owned()));
        }

        self.season.parse()?;

        if self.publish.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("publish.bucket must not be empty".to_owned()));
        }
        if self.publish.key.trim().is_empty() {
            return Err(ConfigError::Invalid("publish.key must not be empty".to_owned()));
        }
        if self.publish.interval_seconds == 0 {
            return Err(ConfigError::Invalid("publish.interval_seconds must be positive".to_owned()));
        }
        if self.publish.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid("publish.max_consecutive_failures must be at least 1".to_owned()));
        }

        if !(1..=28).contains(&self.backup.day_of_month) {
            return Err(ConfigError::Invalid("backup.day_of_month must be in 1..=28".to_owned()));
        }
        if self.backup.hour > 23 {
            return Err(ConfigError::Invalid("backup.hour must be in 0..=23".to_owned()));
        }

        if !self.alert.email_to.trim().is_empty() && self.alert.smtp_host.trim().is_empty() {
            return Err(ConfigError::Invalid("alert.smtp_host is required when alert.email_to is set".to_owned()));
        }

        Ok(())
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.store.flush_interval_secs)
    }

    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish.interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_operator_input() {
        // source_a.topics, source_b credentials and publish.bucket are all
        // blank by default; an operator must supply real values.
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn topics_parse_pattern_table_desc_triples() {
        let config = SourceAAppConfig {
            topics: "sensors/#:observations:all sensors;status/+:observations:status".to_owned(),
            ..SourceAAppConfig::default()
        };
        let topics = config.parse_topics().unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].pattern, "sensors/#");
        assert_eq!(topics[0].table, "observations");
        assert_eq!(topics[1].description, "status");
    }

    #[test]
    fn topics_reject_missing_table() {
        let config = SourceAAppConfig { topics: "sensors/#".to_owned(), ..SourceAAppConfig::default() };
        assert!(config.parse_topics().is_err());
    }

    #[test]
    fn season_rejects_end_before_start() {
        let season = SeasonAppConfig { start: "2025-03-01".to_owned(), end: "2025-01-01".to_owned() };
        assert!(season.parse().is_err());
    }

    #[test]
    fn device_lists_split_on_comma_and_trim() {
        let config = SourceBAppConfig {
            devices_air: " air-1, air-2 ".to_owned(),
            devices_water: "water-1".to_owned(),
            ..SourceBAppConfig::default()
        };
        assert_eq!(config.air_devices(), vec!["air-1", "air-2"]);
        assert_eq!(config.water_devices(), vec!["water-1"]);
    }
}
