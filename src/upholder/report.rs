//! Immutable values emitted by the audit components. Kind strings are
//! stable: sink consumers key on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::PoolStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIssueKind {
    SeqScanOnLargeTable,
    SlowMean,
    HighVariance,
    PoorCacheLocality,
    Unparameterized,
    ExtensionMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIssue {
    pub queryid: i64,
    /// Normalized statement text identifying the workload entry.
    pub fingerprint: String,
    pub kind: QueryIssueKind,
    pub severity: Severity,
    pub calls: i64,
    pub mean_ms: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFindingKind {
    Missing,
    Unused,
    Duplicate,
    RedundantPrefix,
    Bloated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFinding {
    pub schema: String,
    pub table: String,
    pub kind: IndexFindingKind,
    /// Existing index the finding refers to; `None` for missing-index
    /// findings.
    pub index: Option<String>,
    pub columns: Vec<String>,
    pub supporting_evidence: String,
    pub confidence: f64,
    /// Ready-to-review DDL or maintenance advice. Never executed unless
    /// the orchestrator's safety gates allow it.
    pub recommendation: String,
    /// True only for actions the orchestrator may auto-apply: plain,
    /// non-unique, non-partial index creation.
    pub safe: bool,
}

impl IndexFinding {
    /// Identity for set-comparison across audit cycles.
    pub fn identity(&self) -> (String, String, IndexFindingKind, Option<String>, Vec<String>) {
        (
            self.schema.clone(),
            self.table.clone(),
            self.kind,
            self.index.clone(),
            self.columns.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheSample {
    pub timestamp: DateTime<Utc>,
    pub heap_hit_ratio: f64,
    pub index_hit_ratio: f64,
    pub buffers_used_pct: f64,
    /// Background-writer halts observed since the previous sample.
    pub bgwriter_lag: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheAlertKind {
    LowHeap,
    LowIndex,
    HighBufferPressure,
}

impl CacheAlertKind {
    pub const fn recommendation(&self) -> &'static str {
        match self {
            Self::LowHeap => {
                "heap hit ratio is low: consider increasing shared_buffers and reviewing frequently scanned tables"
            }
            Self::LowIndex => {
                "index hit ratio is low: consider increasing shared_buffers and running ANALYZE on hot tables"
            }
            Self::HighBufferPressure => {
                "buffer cache is under pressure: review working-set size and shared_buffers"
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: CacheAlertKind,
    pub subject: String,
    pub observed: f64,
    pub threshold: f64,
    pub recommendation: String,
    pub emitted_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

/// One audit cycle's output, immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries: Vec<QueryIssue>,
    pub indexes: Vec<IndexFinding>,
    pub cache: Vec<CacheSample>,
    pub pool: PoolStats,
    pub summary: String,
    pub cancelled: bool,
    pub partial: bool,
    pub failed_components: Vec<String>,
}

impl Report {
    pub fn build_summary(&mut self) {
        let critical = self
            .queries
            .iter()
            .filter(|q| q.severity == Severity::Critical)
            .count();
        let warnings = self
            .queries
            .iter()
            .filter(|q| q.severity == Severity::Warn)
            .count();
        let missing = self
            .indexes
            .iter()
            .filter(|i| i.kind == IndexFindingKind::Missing)
            .count();
        let unused = self
            .indexes
            .iter()
            .filter(|i| i.kind == IndexFindingKind::Unused)
            .count();
        let mut summary = format!(
            "{} query issues ({critical} critical, {warnings} warnings), {} index findings ({missing} missing, {unused} unused)",
            self.queries.len(),
            self.indexes.len(),
        );
        if let Some(sample) = self.cache.last() {
            summary.push_str(&format!(
                ", heap hit {:.1}%, index hit {:.1}%",
                sample.heap_hit_ratio * 100.0,
                sample.index_hit_ratio * 100.0
            ));
        }
        if self.cancelled {
            summary.push_str(" [cancelled]");
        } else if self.partial {
            summary.push_str(&format!(" [partial: {}]", self.failed_components.join(", ")));
        }
        self.summary = summary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> Report {
        Report {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            queries: Vec::new(),
            indexes: Vec::new(),
            cache: Vec::new(),
            pool: PoolStats::default(),
            summary: String::new(),
            cancelled: false,
            partial: false,
            failed_components: Vec::new(),
        }
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            serde_json::to_string(&QueryIssueKind::SeqScanOnLargeTable).unwrap(),
            "\"seq_scan_on_large_table\""
        );
        assert_eq!(
            serde_json::to_string(&IndexFindingKind::RedundantPrefix).unwrap(),
            "\"redundant_prefix\""
        );
        assert_eq!(
            serde_json::to_string(&CacheAlertKind::LowHeap).unwrap(),
            "\"low_heap\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Critical);
    }

    #[test]
    fn summary_counts_by_kind() {
        let mut report = empty_report();
        report.queries.push(QueryIssue {
            queryid: 1,
            fingerprint: "SELECT * FROM orders WHERE status = $?".into(),
            kind: QueryIssueKind::SlowMean,
            severity: Severity::Warn,
            calls: 500,
            mean_ms: 180.0,
            recommendation: String::new(),
        });
        report.indexes.push(IndexFinding {
            schema: "public".into(),
            table: "orders".into(),
            kind: IndexFindingKind::Missing,
            index: None,
            columns: vec!["status".into()],
            supporting_evidence: String::new(),
            confidence: 1.0,
            recommendation: "CREATE INDEX ON orders (status)".into(),
            safe: true,
        });
        report.build_summary();
        assert!(report.summary.contains("1 query issues"));
        assert!(report.summary.contains("1 warnings"));
        assert!(report.summary.contains("1 missing"));
        assert!(!report.summary.contains("[cancelled]"));
    }

    #[test]
    fn summary_flags_cancellation_and_partial() {
        let mut report = empty_report();
        report.cancelled = true;
        report.build_summary();
        assert!(report.summary.contains("[cancelled]"));

        let mut report = empty_report();
        report.partial = true;
        report.failed_components.push("index_auditor".into());
        report.build_summary();
        assert!(report.summary.contains("[partial: index_auditor]"));
    }

    #[test]
    fn report_serializes_round_trip() {
        let mut report = empty_report();
        report.build_summary();
        let json = serde_json::to_string(&report).unwrap();
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, report.summary);
    }
}
