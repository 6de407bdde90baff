//! Application config
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::backoff::{BackoffPolicy, StoragePolicy};

/// Broker side of the pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// comma separated bootstrap brokers
    pub brokers: String,
    /// topic carrying the envelopes
    pub topic: String,
    /// consumer group shared by all instances
    pub consumer_group: String,
    /// where a group without committed offsets starts (default: earliest)
    pub offset_reset: String,
    pub session_timeout_ms: u64,
    /// deliveries queued per claimed partition
    pub claim_buffer: usize,
    /// how long a publish may wait for the broker
    pub publish_timeout_ms: u64,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        KafkaSettings {
            brokers: String::from("localhost:9092"),
            topic: String::from("notifications"),
            consumer_group: String::from("notifications-group"),
            offset_reset: String::from("earliest"),
            session_timeout_ms: 10_000,
            claim_buffer: 64,
            publish_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub max_pool_size: usize,
    /// bound on opening a connection and on waiting for a pooled one
    pub connect_timeout_ms: u64,
    /// bound on a whole write or query, connection checkout included
    pub query_timeout_ms: u64,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        PostgresSettings {
            host: String::from("localhost"),
            port: 5432,
            user: String::from("postgres"),
            password: String::from("postgres"),
            dbname: String::from("postgres"),
            max_pool_size: 8,
            connect_timeout_ms: 5_000,
            query_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 1.0 keeps the delay fixed
    pub growth_factor: f64,
}

impl BackoffSettings {
    fn fixed(delay_ms: u64) -> Self {
        BackoffSettings {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            growth_factor: 1.0,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.growth_factor,
        )
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings::fixed(5_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Skip,
    Retry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoragePolicySettings {
    /// `skip` drops a sample the store refused, `retry` tries `attempts` times first
    pub mode: StorageMode,
    pub attempts: u32,
    pub backoff: BackoffSettings,
}

impl StoragePolicySettings {
    pub fn policy(&self) -> StoragePolicy {
        match self.mode {
            StorageMode::Skip => StoragePolicy::SkipImmediately,
            StorageMode::Retry => StoragePolicy::RetryThenSkip {
                attempts: self.attempts,
                backoff: self.backoff.policy(),
            },
        }
    }
}

impl Default for StoragePolicySettings {
    fn default() -> Self {
        StoragePolicySettings {
            mode: StorageMode::Skip,
            attempts: 3,
            backoff: BackoffSettings::fixed(1_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub kafka: KafkaSettings,
    pub postgres: PostgresSettings,
    /// envelope codec, see [crate::codec::get_codec]
    pub codec: String,
    /// group supervisor retry schedule
    pub backoff: BackoffSettings,
    pub storage_policy: StoragePolicySettings,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            kafka: KafkaSettings::default(),
            postgres: PostgresSettings::default(),
            codec: String::from("json"),
            backoff: BackoffSettings::default(),
            storage_policy: StoragePolicySettings::default(),
            log_level: String::from("info"),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    pub fn new(cfgfile: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));
        if let Some(path) = cfgfile {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("TEMPSINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.claim_buffer == 0 {
            return Err(ConfigError::Message(
                "kafka.claim_buffer must be positive".into(),
            ));
        }
        if self.postgres.connect_timeout_ms == 0 || self.postgres.query_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "postgres timeouts must be positive".into(),
            ));
        }
        if self.storage_policy.mode == StorageMode::Retry && self.storage_policy.attempts == 0 {
            return Err(ConfigError::Message(
                "storage_policy.attempts must be positive".into(),
            ));
        }
        for (name, backoff) in [
            ("backoff", &self.backoff),
            ("storage_policy.backoff", &self.storage_policy.backoff),
        ] {
            if !(backoff.growth_factor >= 1.0) {
                return Err(ConfigError::Message(format!(
                    "{name}.growth_factor must be at least 1.0"
                )));
            }
        }
        if !matches!(self.codec.as_str(), "json" | "avro") {
            return Err(ConfigError::Message(format!("unknown codec {}", self.codec)));
        }
        Ok(())
    }
}
