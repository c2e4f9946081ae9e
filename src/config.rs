//! Typed configuration. Recognized keys are exactly the ones on these
//! structs: unknown keys fail the load, so a typoed option can never
//! silently fall back to a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pool::PoolConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct UpkeepConfig {
    pub pool: PoolSection,
    pub statement_cache: StatementCacheSection,
    pub query_analyzer: QueryAnalyzerSection,
    pub index_auditor: IndexAuditorSection,
    pub cache_monitor: CacheMonitorSection,
    pub orchestrator: OrchestratorSection,
    pub bulk: BulkSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSection {
    pub min_conn: usize,
    pub max_conn: usize,
    pub acquire_timeout_ms: u64,
    pub max_idle_age_s: u64,
    pub health_sweep_interval_s: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_conn: 5,
            max_conn: 32,
            acquire_timeout_ms: 5000,
            max_idle_age_s: 300,
            health_sweep_interval_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StatementCacheSection {
    pub cache_cap_per_session: usize,
}

impl Default for StatementCacheSection {
    fn default() -> Self {
        Self {
            cache_cap_per_session: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueryAnalyzerSection {
    pub interval_min: u64,
    pub slow_mean_ms: f64,
    pub min_calls: i64,
    pub top_n: usize,
    pub explain_sample_rate: f64,
    pub seq_scan_threshold_rows: i64,
    /// Statement prefixes to skip, e.g. the auditor's own catalog SQL.
    pub ignore_prefixes: Vec<String>,
}

impl Default for QueryAnalyzerSection {
    fn default() -> Self {
        Self {
            interval_min: 60,
            slow_mean_ms: 100.0,
            min_calls: 10,
            top_n: 50,
            explain_sample_rate: 0.2,
            seq_scan_threshold_rows: 10_000,
            ignore_prefixes: vec![
                "EXPLAIN".to_string(),
                "SELECT version()".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexAuditorSection {
    pub interval_min: u64,
    pub schemas: Vec<String>,
    pub min_table_bytes: i64,
    pub max_tables_per_pass: i64,
    pub unused_idx_scan_threshold: i64,
    pub min_age_days: i64,
    pub seq_ratio_threshold: f64,
    pub min_rows: i64,
    pub bloat_threshold: f64,
    pub min_bloat_bytes: i64,
}

impl Default for IndexAuditorSection {
    fn default() -> Self {
        Self {
            interval_min: 240,
            schemas: vec!["public".to_string()],
            min_table_bytes: 1_048_576,
            max_tables_per_pass: 200,
            unused_idx_scan_threshold: 0,
            min_age_days: 7,
            seq_ratio_threshold: 0.5,
            min_rows: 10_000,
            bloat_threshold: 0.3,
            min_bloat_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheMonitorSection {
    pub interval_s: u64,
    pub heap_hit_min: f64,
    pub index_hit_min: f64,
    pub history_len: usize,
}

impl Default for CacheMonitorSection {
    fn default() -> Self {
        Self {
            interval_s: 30,
            heap_hit_min: 0.95,
            index_hit_min: 0.90,
            history_len: 480,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorSection {
    pub dry_run: bool,
    pub auto_apply_safe: bool,
    pub alert_cooldown_min: i64,
    pub sink_timeout_ms: u64,
    pub sink_disable_after: u32,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            dry_run: true,
            auto_apply_safe: false,
            alert_cooldown_min: 60,
            sink_timeout_ms: 500,
            sink_disable_after: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BulkSection {
    pub values_per_statement: usize,
    pub copy_chunk_rows: usize,
    pub max_attempts: u32,
}

impl Default for BulkSection {
    fn default() -> Self {
        Self {
            values_per_statement: 500,
            copy_chunk_rows: 10_000,
            max_attempts: 3,
        }
    }
}

impl UpkeepConfig {
    /// Default config location: `~/.config/pg_upkeep/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pg_upkeep").join("config.toml"))
    }

    /// Loads configuration. An explicit path must exist and parse; the
    /// default path is used when present, otherwise built-in defaults
    /// apply. All results are validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.is_file() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.pool.max_conn == 0 {
            return Err(invalid("pool.max_conn", "must be at least 1"));
        }
        if self.pool.min_conn > self.pool.max_conn {
            return Err(invalid(
                "pool.min_conn",
                format!(
                    "must not exceed pool.max_conn ({} > {})",
                    self.pool.min_conn, self.pool.max_conn
                ),
            ));
        }
        if self.statement_cache.cache_cap_per_session == 0 {
            return Err(invalid("statement_cache.cache_cap_per_session", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.query_analyzer.explain_sample_rate) {
            return Err(invalid(
                "query_analyzer.explain_sample_rate",
                "must be within [0, 1]",
            ));
        }
        if self.query_analyzer.top_n == 0 {
            return Err(invalid("query_analyzer.top_n", "must be at least 1"));
        }
        if self.index_auditor.schemas.is_empty() {
            return Err(invalid("index_auditor.schemas", "must name at least one schema"));
        }
        if !(0.0..=1.0).contains(&self.index_auditor.seq_ratio_threshold) {
            return Err(invalid(
                "index_auditor.seq_ratio_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.index_auditor.bloat_threshold) {
            return Err(invalid("index_auditor.bloat_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.cache_monitor.heap_hit_min) {
            return Err(invalid("cache_monitor.heap_hit_min", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.cache_monitor.index_hit_min) {
            return Err(invalid("cache_monitor.index_hit_min", "must be within [0, 1]"));
        }
        if self.cache_monitor.history_len == 0 {
            return Err(invalid("cache_monitor.history_len", "must be at least 1"));
        }
        if self.bulk.values_per_statement == 0 {
            return Err(invalid("bulk.values_per_statement", "must be at least 1"));
        }
        if self.bulk.copy_chunk_rows == 0 {
            return Err(invalid("bulk.copy_chunk_rows", "must be at least 1"));
        }
        if self.bulk.max_attempts == 0 {
            return Err(invalid("bulk.max_attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_conn: self.pool.min_conn,
            max_conn: self.pool.max_conn,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            max_idle_age: Duration::from_secs(self.pool.max_idle_age_s),
            cache_cap_per_session: self.statement_cache.cache_cap_per_session,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = UpkeepConfig::default();
        assert_eq!(config.pool.min_conn, 5);
        assert_eq!(config.pool.max_conn, 32);
        assert_eq!(config.pool.acquire_timeout_ms, 5000);
        assert_eq!(config.statement_cache.cache_cap_per_session, 128);
        assert_eq!(config.query_analyzer.slow_mean_ms, 100.0);
        assert_eq!(config.query_analyzer.top_n, 50);
        assert_eq!(config.index_auditor.interval_min, 240);
        assert_eq!(config.index_auditor.min_age_days, 7);
        assert_eq!(config.cache_monitor.heap_hit_min, 0.95);
        assert_eq!(config.cache_monitor.index_hit_min, 0.90);
        assert_eq!(config.cache_monitor.history_len, 480);
        assert!(config.orchestrator.dry_run);
        assert!(!config.orchestrator.auto_apply_safe);
        assert_eq!(config.bulk.values_per_statement, 500);
        assert_eq!(config.bulk.max_attempts, 3);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let toml = r#"
            [pool]
            max_conn = 8

            [orchestrator]
            dry_run = false
        "#;
        let config: UpkeepConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.pool.max_conn, 8);
        assert_eq!(config.pool.min_conn, 5);
        assert!(!config.orchestrator.dry_run);
        assert_eq!(config.cache_monitor.interval_s, 30);
    }

    #[test]
    fn unknown_key_is_a_hard_error() {
        let toml = r#"
            [pool]
            max_connz = 8
        "#;
        let result: Result<UpkeepConfig, _> = toml::from_str(toml);
        assert!(result.is_err());

        let toml = r#"
            [poool]
            max_conn = 8
        "#;
        let result: Result<UpkeepConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn min_conn_above_max_conn_rejected() {
        let mut config = UpkeepConfig::default();
        config.pool.min_conn = 64;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pool.min_conn",
                ..
            }
        ));
    }

    #[test]
    fn sample_rate_out_of_range_rejected() {
        let mut config = UpkeepConfig::default();
        config.query_analyzer.explain_sample_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_explicit_missing_path_fails() {
        let err = UpkeepConfig::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [cache_monitor]
            interval_s = 5
            history_len = 12
            "#
        )
        .unwrap();
        let config = UpkeepConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache_monitor.interval_s, 5);
        assert_eq!(config.cache_monitor.history_len, 12);
    }

    #[test]
    fn pool_config_conversion() {
        let config = UpkeepConfig::default();
        let pool = config.pool_config();
        assert_eq!(pool.max_conn, 32);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(5000));
        assert_eq!(pool.max_idle_age, Duration::from_secs(300));
        assert_eq!(pool.cache_cap_per_session, 128);
    }
}
