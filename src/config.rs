//! Worker configuration, read from the environment.
//!
//! Every binary loads `.env` through `dotenvy` first; after that only the
//! process environment is consulted. Parsing goes through a lookup closure so
//! tests can feed a fixed map.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use wordloom_core::outbox::Projection;
use wordloom_core::retry::RetryPolicy;
use wordloom_postgres::TxMode;

use crate::faults::FaultConfig;
use crate::telemetry::LogFormat;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Reads one key; blank values count as unset.
pub(crate) struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> Env<'a> {
    pub(crate) fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    pub(crate) fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    pub(crate) fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub(crate) fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected true or false".into(),
            }),
        }
    }
}

/// Knobs the worker loop itself needs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub batch_size: u32,
    pub lease_ttl: Duration,
    pub max_processing: Duration,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    pub retry: RetryPolicy,
    /// Sleep after a database error before the next cycle.
    pub db_error_backoff: Duration,
    /// Restore W3C trace context into row spans.
    pub tracing_enabled: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            batch_size: 50,
            lease_ttl: Duration::from_secs(60),
            max_processing: Duration::from_secs(30),
            idle_backoff_min: Duration::from_millis(200),
            idle_backoff_max: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            db_error_backoff: Duration::from_secs(1),
            tracing_enabled: true,
        }
    }
}

impl WorkerOptions {
    /// Per-row projector deadline.
    pub fn row_timeout(&self) -> Duration {
        self.lease_ttl.min(self.max_processing)
    }
}

/// Full `outbox_worker` configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub env: String,
    pub database_url: String,
    pub projection: Projection,
    pub worker: WorkerOptions,
    pub shutdown_deadline: Duration,
    pub health_silence: Duration,
    pub missing_source_max_attempts: u32,
    pub es_url: Option<String>,
    pub es_index: String,
    pub log_format: LogFormat,
    pub metrics_port: u16,
    pub service_name: String,
    pub faults: FaultConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env::new(lookup);

        let projection_raw = env.required("WORDLOOM_OUTBOX_PROJECTION")?;
        let projection = match projection_raw.parse::<Projection>() {
            Ok(p) if p.outbox_table().is_some() => p,
            Ok(p) => {
                return Err(ConfigError::Invalid {
                    key: "WORDLOOM_OUTBOX_PROJECTION",
                    value: projection_raw,
                    reason: format!("projection '{p}' has no outbox"),
                })
            }
            Err(e) => {
                return Err(ConfigError::Invalid {
                    key: "WORDLOOM_OUTBOX_PROJECTION",
                    value: projection_raw,
                    reason: e.to_string(),
                })
            }
        };

        let batch_size: u32 = env.parse_or("WORDLOOM_OUTBOX_BATCH_SIZE", 50)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "WORDLOOM_OUTBOX_BATCH_SIZE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let lease_ttl = Duration::from_secs(env.parse_or("WORDLOOM_OUTBOX_LEASE_TTL_SECONDS", 60)?);
        let idle_backoff_min =
            Duration::from_millis(env.parse_or("WORDLOOM_OUTBOX_IDLE_BACKOFF_MIN_MS", 200)?);
        let idle_backoff_max =
            Duration::from_millis(env.parse_or("WORDLOOM_OUTBOX_IDLE_BACKOFF_MAX_MS", 5000)?);
        let max_processing =
            Duration::from_secs(env.parse_or("WORDLOOM_OUTBOX_MAX_PROCESSING_SECONDS", 30)?);
        let retry = RetryPolicy {
            base: Duration::from_millis(env.parse_or("WORDLOOM_OUTBOX_RETRY_BASE_MS", 500)?),
            cap: Duration::from_millis(env.parse_or("WORDLOOM_OUTBOX_RETRY_CAP_MS", 60_000)?),
            max_attempts: env.parse_or("WORDLOOM_OUTBOX_RETRY_MAX_ATTEMPTS", 8)?,
        };
        let otel_disabled = env.flag("OTEL_SDK_DISABLED")?;

        let worker = WorkerOptions {
            worker_id: env
                .get("WORDLOOM_OUTBOX_WORKER_ID")
                .unwrap_or_else(default_worker_id),
            batch_size,
            lease_ttl,
            max_processing,
            idle_backoff_min,
            idle_backoff_max,
            retry,
            db_error_backoff: Duration::from_secs(1),
            tracing_enabled: !otel_disabled,
        };

        Ok(Self {
            env: env.required("WORDLOOM_ENV")?,
            database_url: env.required("DATABASE_URL")?,
            projection,
            worker,
            shutdown_deadline: Duration::from_secs(
                env.parse_or("WORDLOOM_OUTBOX_SHUTDOWN_DEADLINE_SECONDS", 30)?,
            ),
            health_silence: Duration::from_secs(
                env.parse_or("WORDLOOM_OUTBOX_HEALTH_SILENCE_SECONDS", 10)?,
            ),
            missing_source_max_attempts: env.parse_or(missing_source_key(projection), 3)?,
            es_url: env.get("WORDLOOM_SEARCH_ES_URL"),
            es_index: env
                .get("WORDLOOM_SEARCH_ES_INDEX")
                .unwrap_or_else(|| "wordloom_search".into()),
            log_format: env.parse_or("WORDLOOM_LOG_FORMAT", LogFormat::Json)?,
            metrics_port: env.parse_or("OUTBOX_METRICS_PORT", 9108)?,
            service_name: env
                .get("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| format!("wordloom-outbox-{}", projection.as_str())),
            faults: FaultConfig::from_env(&env)?,
        })
    }
}

/// Each projection family has its own missing-source budget.
fn missing_source_key(projection: Projection) -> &'static str {
    match projection {
        Projection::Chronicle => "WORDLOOM_CHRONICLE_MISSING_SOURCE_MAX_ATTEMPTS",
        Projection::Search | Projection::Basement => "WORDLOOM_SEARCH_MISSING_SOURCE_MAX_ATTEMPTS",
    }
}

/// Transaction mode for an in-process [`wordloom_postgres::EventBus`].
pub fn bus_tx_mode(lookup: &dyn Fn(&str) -> Option<String>) -> Result<TxMode, ConfigError> {
    Env::new(lookup).parse_or("WORDLOOM_EVENT_BUS_TX_MODE", TxMode::default())
}

/// `<hostname>-<pid>`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "wordloom".into());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(&move |k| map.get(k).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("WORDLOOM_ENV", "test"),
        ("DATABASE_URL", "postgres://localhost/wordloom"),
        ("WORDLOOM_OUTBOX_PROJECTION", "search"),
    ];

    #[test]
    fn defaults_apply() {
        let cfg = config(&REQUIRED).unwrap();
        assert_eq!(cfg.projection, Projection::Search);
        assert_eq!(cfg.worker.batch_size, 50);
        assert_eq!(cfg.worker.lease_ttl, Duration::from_secs(60));
        assert_eq!(cfg.worker.max_processing, Duration::from_secs(30));
        assert_eq!(cfg.worker.row_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.worker.retry, RetryPolicy::default());
        assert_eq!(cfg.metrics_port, 9108);
        assert_eq!(cfg.es_index, "wordloom_search");
        assert_eq!(cfg.missing_source_max_attempts, 3);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.worker.tracing_enabled);
        assert_eq!(cfg.faults, FaultConfig::default());
    }

    #[test]
    fn missing_required_keys_are_named() {
        let err = config(&REQUIRED[1..]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("WORDLOOM_ENV"));
        let err = config(&REQUIRED[..2]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("WORDLOOM_OUTBOX_PROJECTION"));
    }

    #[test]
    fn basement_has_no_worker() {
        let mut pairs = REQUIRED.to_vec();
        pairs[2] = ("WORDLOOM_OUTBOX_PROJECTION", "basement");
        assert!(matches!(config(&pairs), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn overrides_parse() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("WORDLOOM_OUTBOX_BATCH_SIZE", "5"),
            ("WORDLOOM_OUTBOX_LEASE_TTL_SECONDS", "10"),
            ("WORDLOOM_OUTBOX_RETRY_MAX_ATTEMPTS", "3"),
            ("WORDLOOM_OUTBOX_WORKER_ID", "w-1"),
            ("WORDLOOM_LOG_FORMAT", "pretty"),
            ("OTEL_SDK_DISABLED", "true"),
            ("OUTBOX_EXPERIMENT_ES_429_EVERY_N", "2"),
            ("OUTBOX_EXPERIMENT_OPS", "delete"),
        ]);
        let cfg = config(&pairs).unwrap();
        assert_eq!(cfg.worker.batch_size, 5);
        assert_eq!(cfg.worker.row_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.worker.retry.max_attempts, 3);
        assert_eq!(cfg.worker.worker_id, "w-1");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert!(!cfg.worker.tracing_enabled);
        assert_eq!(cfg.faults.es_429_every_n, Some(2));
        assert_eq!(cfg.faults.ops, Some(vec!["delete".to_string()]));
    }

    #[test]
    fn missing_source_budget_is_per_projection() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("WORDLOOM_SEARCH_MISSING_SOURCE_MAX_ATTEMPTS", "7"),
            ("WORDLOOM_CHRONICLE_MISSING_SOURCE_MAX_ATTEMPTS", "2"),
        ]);
        assert_eq!(config(&pairs).unwrap().missing_source_max_attempts, 7);
        pairs[2] = ("WORDLOOM_OUTBOX_PROJECTION", "chronicle");
        assert_eq!(config(&pairs).unwrap().missing_source_max_attempts, 2);
    }

    #[test]
    fn bus_mode_defaults_to_savepoint() {
        assert_eq!(bus_tx_mode(&|_| None).unwrap(), TxMode::Savepoint);
        assert_eq!(
            bus_tx_mode(&|_| Some("ATOMIC".into())).unwrap(),
            TxMode::Atomic
        );
        assert!(bus_tx_mode(&|_| Some("nested".into())).is_err());
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("WORDLOOM_OUTBOX_BATCH_SIZE", "lots"));
        let err = config(&pairs).unwrap_err();
        assert!(err.to_string().contains("WORDLOOM_OUTBOX_BATCH_SIZE"));
    }
}
