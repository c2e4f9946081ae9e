use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DetectedExtensions {
    pub pg_stat_statements: bool,
    pub pg_buffercache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub extensions: DetectedExtensions,
}

impl ServerInfo {
    /// Parse "PostgreSQL 16.2 on x86_64..." -> 16
    pub fn major_version(&self) -> u32 {
        self.version
            .strip_prefix("PostgreSQL ")
            .and_then(|rest| rest.split('.').next())
            .and_then(|major| major.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// One row of `pg_stat_statements`, already reduced to the columns the
/// analyzer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStat {
    pub queryid: i64,
    pub sample_text: String,
    pub calls: i64,
    pub total_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
}

impl QueryStat {
    /// Fraction of shared-block reads served from the buffer cache.
    pub fn cache_locality(&self) -> f64 {
        self.shared_blks_hit as f64
            / (self.shared_blks_hit + self.shared_blks_read + 1) as f64
    }

    /// Spread between the fastest and slowest execution relative to the
    /// mean; large values mean inconsistent performance.
    pub fn variance_ratio(&self) -> f64 {
        (self.max_ms - self.min_ms) / (self.mean_ms + f64::EPSILON)
    }
}

/// Per-table workload profile from `pg_stat_user_tables` + `pg_class`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProfile {
    pub schema: String,
    pub name: String,
    pub row_estimate: i64,
    pub total_bytes: i64,
    pub heap_bytes: i64,
    pub index_bytes: i64,
    pub seq_scan_count: i64,
    pub idx_scan_count: i64,
    pub hot_update_ratio: f64,
    pub live_tuples: i64,
    pub dead_tuples: i64,
    pub mod_since_analyze: i64,
    pub last_analyze: Option<DateTime<Utc>>,
    pub last_autoanalyze: Option<DateTime<Utc>>,
}

impl TableProfile {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Share of scans that had to walk the heap sequentially.
    pub fn seq_scan_ratio(&self) -> f64 {
        self.seq_scan_count as f64
            / (self.seq_scan_count + self.idx_scan_count + 1) as f64
    }

    pub fn dead_tuple_fraction(&self) -> f64 {
        let total = self.live_tuples + self.dead_tuples;
        if total == 0 {
            0.0
        } else {
            self.dead_tuples as f64 / total as f64
        }
    }

    /// Statistics are stale when more than 10% of rows changed since
    /// the last (auto)analyze.
    pub fn stats_stale(&self) -> bool {
        self.mod_since_analyze > 0
            && self.mod_since_analyze as f64 > 0.1 * (self.row_estimate.max(1)) as f64
    }
}

/// Per-index profile from `pg_stat_user_indexes` + `pg_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexProfile {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
    pub is_partial: bool,
    pub predicate: Option<String>,
    pub backs_constraint: bool,
    pub size_bytes: i64,
    pub scans: i64,
    pub tuples_read: i64,
    pub tuples_fetched: i64,
    /// Estimated wasted fraction of the index, 0 when unknown.
    pub bloat_estimate: f64,
}

impl IndexProfile {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Raw cumulative counters behind a cache sample; ratios are computed
/// from deltas between consecutive readings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheCounters {
    pub heap_blks_hit: i64,
    pub heap_blks_read: i64,
    pub idx_blks_hit: i64,
    pub idx_blks_read: i64,
    pub buffers_used: i64,
    pub buffers_total: i64,
    pub maxwritten_clean: i64,
}

/// One column's most-common-value statistics, used to substitute
/// representative literals when sampling plans.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    pub table: String,
    pub column: String,
    pub most_common: Option<String>,
    pub data_type: String,
}
