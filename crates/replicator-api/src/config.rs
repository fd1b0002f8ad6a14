//! Service configuration.
//!
//! Values come from an optional YAML file named by `REPLICATOR_CONFIG`,
//! then from environment variables, which win.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use replicator_consumer::application::applier::DeletePolicy;
use replicator_core::event::EntityType;
use replicator_core::retry::RetryPolicy;
use serde::Deserialize;

use crate::error::AppError;

/// Which transport connects publishers and consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Durable replication log in `PostgreSQL`.
    #[default]
    Postgres,
    /// In-process channel; publisher and consumer share this process.
    Memory,
}

impl FromStr for ChannelKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(ChannelKind::Postgres),
            "memory" => Ok(ChannelKind::Memory),
            other => Err(AppError::Config(format!(
                "REPLICATOR_CHANNEL must be 'postgres' or 'memory', got '{other}'"
            ))),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicatorConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub channel: ChannelKind,
    pub partitions: u32,
    pub consumer_group: String,
    /// Partitions this instance consumes; all of them when absent.
    pub owned_partitions: Option<Vec<u32>>,
    /// Entity types this instance replicates.
    pub entities: Vec<EntityType>,
    pub delete_policy: DeletePolicy,
    pub publish_max_attempts: u32,
    pub apply_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How long ledger entries of deleted entities are kept.
    pub ledger_retention_days: u32,
    pub retention_sweep_secs: u64,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_max_connections: 10,
            channel: ChannelKind::Postgres,
            partitions: 8,
            consumer_group: "replicator".to_string(),
            owned_partitions: None,
            entities: EntityType::ALL.to_vec(),
            delete_policy: DeletePolicy::Remove,
            publish_max_attempts: 5,
            apply_max_attempts: 5,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            ledger_retention_days: 30,
            retention_sweep_secs: 3600,
            poll_interval_ms: 250,
            lease_secs: 30,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{name} is invalid: {e}")))
}

fn parse_list<T: FromStr>(name: &str, value: &str) -> Result<Vec<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_var(name, item))
        .collect()
}

impl ReplicatorConfig {
    /// Loads the configuration from `REPLICATOR_CONFIG` and the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed, or a
    /// value is invalid.
    pub fn load() -> Result<Self, AppError> {
        let yaml = match std::env::var("REPLICATOR_CONFIG") {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                AppError::Config(format!("cannot read config file {path}: {e}"))
            })?),
            Err(_) => None,
        };
        Self::from_sources(yaml.as_deref(), |name| std::env::var(name).ok())
    }

    /// Builds the configuration from YAML text and an environment lookup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the YAML or a variable is invalid, or
    /// the result fails [`Self::validate`].
    pub fn from_sources(
        yaml: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AppError> {
        let mut config = match yaml {
            Some(text) => serde_yaml::from_str(text)
                .map_err(|e| AppError::Config(format!("invalid config file: {e}")))?,
            None => Self::default(),
        };

        if let Some(value) = env("DATABASE_URL") {
            config.database_url = Some(value);
        }
        if let Some(value) = env("HOST") {
            config.host = value;
        }
        if let Some(value) = env("PORT") {
            config.port = parse_var("PORT", &value)?;
        }
        if let Some(value) = env("DB_MAX_CONNECTIONS") {
            config.db_max_connections = parse_var("DB_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_CHANNEL") {
            config.channel = value.parse()?;
        }
        if let Some(value) = env("REPLICATOR_PARTITIONS") {
            config.partitions = parse_var("REPLICATOR_PARTITIONS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_CONSUMER_GROUP") {
            config.consumer_group = value;
        }
        if let Some(value) = env("REPLICATOR_OWNED_PARTITIONS") {
            config.owned_partitions = Some(parse_list("REPLICATOR_OWNED_PARTITIONS", &value)?);
        }
        if let Some(value) = env("REPLICATOR_ENTITIES") {
            config.entities = parse_list("REPLICATOR_ENTITIES", &value)?;
        }
        if let Some(value) = env("REPLICATOR_DELETE_POLICY") {
            config.delete_policy = match value.trim() {
                "remove" => DeletePolicy::Remove,
                "tombstone" => DeletePolicy::Tombstone,
                other => {
                    return Err(AppError::Config(format!(
                        "REPLICATOR_DELETE_POLICY must be 'remove' or 'tombstone', got '{other}'"
                    )));
                }
            };
        }
        if let Some(value) = env("REPLICATOR_PUBLISH_MAX_ATTEMPTS") {
            config.publish_max_attempts = parse_var("REPLICATOR_PUBLISH_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_APPLY_MAX_ATTEMPTS") {
            config.apply_max_attempts = parse_var("REPLICATOR_APPLY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_RETRY_INITIAL_DELAY_MS") {
            config.retry_initial_delay_ms = parse_var("REPLICATOR_RETRY_INITIAL_DELAY_MS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_RETRY_MAX_DELAY_MS") {
            config.retry_max_delay_ms = parse_var("REPLICATOR_RETRY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_LEDGER_RETENTION_DAYS") {
            config.ledger_retention_days = parse_var("REPLICATOR_LEDGER_RETENTION_DAYS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_RETENTION_SWEEP_SECS") {
            config.retention_sweep_secs = parse_var("REPLICATOR_RETENTION_SWEEP_SECS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("REPLICATOR_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = env("REPLICATOR_LEASE_SECS") {
            config.lease_secs = parse_var("REPLICATOR_LEASE_SECS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.partitions == 0 {
            return Err(AppError::Config("partitions must be at least 1".into()));
        }
        if let Some(owned) = &self.owned_partitions {
            if let Some(partition) = owned.iter().find(|p| **p >= self.partitions) {
                return Err(AppError::Config(format!(
                    "owned partition {partition} is out of range (partitions = {})",
                    self.partitions
                )));
            }
        }
        if self.publish_max_attempts == 0 || self.apply_max_attempts == 0 {
            return Err(AppError::Config("max attempts must be at least 1".into()));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(AppError::Config(
                "retry initial delay exceeds retry max delay".into(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(AppError::Config("consumer group must not be empty".into()));
        }
        // Tombstoned ledger entries must outlive any replay of the channel.
        if self.ledger_retention_days == 0 {
            return Err(AppError::Config(
                "ledger retention must be at least 1 day".into(),
            ));
        }
        if self.lease_secs == 0 {
            return Err(AppError::Config("lease must be at least 1 second".into()));
        }
        Ok(())
    }

    /// The database URL, which every deployment needs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if it is not configured.
    pub fn database_url(&self) -> Result<&str, AppError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| AppError::Config("DATABASE_URL environment variable must be set".into()))
    }

    /// Address the HTTP server binds to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form an address.
    pub fn bind_address(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))
    }

    /// Partitions consumed by this instance, ascending.
    #[must_use]
    pub fn owned_partitions(&self) -> Vec<u32> {
        let mut owned = self
            .owned_partitions
            .clone()
            .unwrap_or_else(|| (0..self.partitions).collect());
        owned.sort_unstable();
        owned.dedup();
        owned
    }

    fn retry(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    #[must_use]
    pub fn publish_retry(&self) -> RetryPolicy {
        self.retry(self.publish_max_attempts)
    }

    #[must_use]
    pub fn apply_retry(&self) -> RetryPolicy {
        self.retry(self.apply_max_attempts)
    }

    #[must_use]
    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ledger_retention_days))
    }

    #[must_use]
    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs.max(1))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = ReplicatorConfig::from_sources(None, env(&[])).unwrap();

        assert_eq!(config, ReplicatorConfig::default());
        assert_eq!(config.owned_partitions(), (0..8).collect::<Vec<_>>());
        assert!(config.database_url().is_err());
    }

    #[test]
    fn test_yaml_file_is_applied() {
        // Arrange
        let yaml = r"
channel: memory
partitions: 4
owned_partitions: [3, 1]
entities: [Company, User]
delete_policy: tombstone
";

        // Act
        let config = ReplicatorConfig::from_sources(Some(yaml), env(&[])).unwrap();

        // Assert
        assert_eq!(config.channel, ChannelKind::Memory);
        assert_eq!(config.partitions, 4);
        assert_eq!(config.owned_partitions(), vec![1, 3]);
        assert_eq!(config.entities, vec![EntityType::Company, EntityType::User]);
        assert_eq!(config.delete_policy, DeletePolicy::Tombstone);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_environment_overrides_file() {
        let yaml = "partitions: 4\nport: 8080\n";

        let config = ReplicatorConfig::from_sources(
            Some(yaml),
            env(&[
                ("DATABASE_URL", "postgres://db/replicas"),
                ("PORT", "9090"),
                ("REPLICATOR_CHANNEL", "Memory"),
                ("REPLICATOR_ENTITIES", "company, product"),
                ("REPLICATOR_OWNED_PARTITIONS", "0,2"),
                ("REPLICATOR_LEDGER_RETENTION_DAYS", "7"),
            ]),
        )
        .unwrap();

        assert_eq!(config.database_url().unwrap(), "postgres://db/replicas");
        assert_eq!(config.port, 9090);
        assert_eq!(config.partitions, 4);
        assert_eq!(config.channel, ChannelKind::Memory);
        assert_eq!(config.entities, vec![EntityType::Company, EntityType::Product]);
        assert_eq!(config.owned_partitions(), vec![0, 2]);
        assert_eq!(config.ledger_retention(), chrono::Duration::days(7));
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let result = ReplicatorConfig::from_sources(None, env(&[("PORT", "not-a-port")]));

        assert!(matches!(result, Err(AppError::Config(message)) if message.contains("PORT")));
    }

    #[test]
    fn test_unknown_entity_type_is_rejected() {
        let result = ReplicatorConfig::from_sources(
            None,
            env(&[("REPLICATOR_ENTITIES", "Company,Invoice")]),
        );

        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_owned_partition_out_of_range_is_rejected() {
        let result = ReplicatorConfig::from_sources(
            None,
            env(&[("REPLICATOR_PARTITIONS", "2"), ("REPLICATOR_OWNED_PARTITIONS", "0,5")]),
        );

        assert!(matches!(
            result,
            Err(AppError::Config(message)) if message.contains("owned partition 5")
        ));
    }

    #[test]
    fn test_unknown_yaml_key_is_rejected() {
        let result = ReplicatorConfig::from_sources(Some("partitons: 4\n"), env(&[]));

        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_day_ledger_retention_is_rejected() {
        let result = ReplicatorConfig::from_sources(
            None,
            env(&[("REPLICATOR_LEDGER_RETENTION_DAYS", "0")]),
        );

        assert!(matches!(result, Err(AppError::Config(message)) if message.contains("retention")));
    }

    #[test]
    fn test_zero_second_lease_is_rejected() {
        let result = ReplicatorConfig::from_sources(Some("lease_secs: 0\n"), env(&[]));

        assert!(matches!(result, Err(AppError::Config(message)) if message.contains("lease")));
    }

    #[test]
    fn test_retry_policies_follow_limits() {
        let config = ReplicatorConfig::from_sources(
            None,
            env(&[
                ("REPLICATOR_PUBLISH_MAX_ATTEMPTS", "2"),
                ("REPLICATOR_APPLY_MAX_ATTEMPTS", "7"),
            ]),
        )
        .unwrap();

        assert!(config.publish_retry().allows_another(1));
        assert!(!config.publish_retry().allows_another(2));
        assert!(config.apply_retry().allows_another(6));
        assert!(!config.apply_retry().allows_another(7));
    }

    #[test]
    fn test_bind_address() {
        let config = ReplicatorConfig::from_sources(
            None,
            env(&[("HOST", "127.0.0.1"), ("PORT", "3100")]),
        )
        .unwrap();

        assert_eq!(config.bind_address().unwrap().to_string(), "127.0.0.1:3100");
    }
}
