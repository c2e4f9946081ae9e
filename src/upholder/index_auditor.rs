//! Index auditor: reconciles the observed workload against existing
//! indexes and reports missing, unused, duplicate, redundant, and
//! bloated ones. Findings are advisory; only the orchestrator's
//! safe-apply path may act on the subset marked safe.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::IndexAuditorSection;
use crate::db::error::Result;
use crate::db::models::{IndexProfile, TableProfile};
use crate::db::queries::{self, quote_ident};
use crate::pool::Session;
use crate::scheduler::Shutdown;
use crate::upholder::query_analyzer::SeqScanEvidence;
use crate::upholder::report::{IndexFinding, IndexFindingKind};

/// Calls that give a missing-index finding full confidence.
const FULL_CONFIDENCE_CALLS: i64 = 100;

pub struct IndexAuditor {
    config: IndexAuditorSection,
    /// When each index was first enumerated. The catalogs carry no
    /// creation timestamp, so unused-index age is measured from first
    /// observation.
    first_seen: HashMap<String, DateTime<Utc>>,
}

/// One auditor pass's output.
#[derive(Debug, Default)]
pub struct IndexAudit {
    pub findings: Vec<IndexFinding>,
    /// Tables whose statistics look stale; candidates for a safe
    /// ANALYZE.
    pub stale_tables: Vec<(String, String)>,
}

impl IndexAuditor {
    pub fn new(config: IndexAuditorSection) -> Self {
        Self {
            config,
            first_seen: HashMap::new(),
        }
    }

    pub async fn run_pass(
        &mut self,
        session: &mut Session,
        evidence: &[SeqScanEvidence],
        shutdown: &Shutdown,
    ) -> Result<IndexAudit> {
        let tables = queries::fetch_table_profiles(
            session,
            &self.config.schemas,
            self.config.min_table_bytes,
            self.config.max_tables_per_pass,
        )
        .await?;
        if shutdown.is_cancelled() {
            return Ok(IndexAudit::default());
        }
        let indexes = queries::fetch_index_profiles(session, &self.config.schemas).await?;

        let now = Utc::now();
        for idx in &indexes {
            self.first_seen
                .entry(index_key(idx))
                .or_insert(now);
        }

        let findings = audit(&tables, &indexes, evidence, &self.first_seen, now, &self.config);
        let stale_tables = tables
            .iter()
            .filter(|t| t.stats_stale())
            .map(|t| (t.schema.clone(), t.name.clone()))
            .collect();
        debug!(
            tables = tables.len(),
            indexes = indexes.len(),
            findings = findings.len(),
            "index audit pass complete"
        );
        Ok(IndexAudit {
            findings,
            stale_tables,
        })
    }
}

fn index_key(idx: &IndexProfile) -> String {
    format!("{}.{}", idx.schema, idx.name)
}

fn table_ddl_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        quote_ident(table)
    } else {
        format!("{}.{}", quote_ident(schema), quote_ident(table))
    }
}

/// Pure audit over the enumerated profiles. Given unchanged inputs the
/// output is identical, which keeps consecutive reports stable.
pub fn audit(
    tables: &[TableProfile],
    indexes: &[IndexProfile],
    evidence: &[SeqScanEvidence],
    first_seen: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &IndexAuditorSection,
) -> Vec<IndexFinding> {
    let mut findings = Vec::new();
    findings.extend(missing_indexes(tables, indexes, evidence, config));
    findings.extend(unused_indexes(indexes, first_seen, now, config));
    findings.extend(duplicate_and_redundant(indexes));
    findings.extend(bloated_indexes(indexes, config));
    findings
}

fn missing_indexes(
    tables: &[TableProfile],
    indexes: &[IndexProfile],
    evidence: &[SeqScanEvidence],
    config: &IndexAuditorSection,
) -> Vec<IndexFinding> {
    let mut findings = Vec::new();
    for table in tables {
        if table.seq_scan_ratio() <= config.seq_ratio_threshold
            || table.row_estimate <= config.min_rows
        {
            continue;
        }
        // Bucket the workload evidence for this table by column list.
        let mut buckets: Vec<(Vec<String>, i64)> = Vec::new();
        for ev in evidence.iter().filter(|e| e.table == table.name) {
            if ev.columns.is_empty() {
                continue;
            }
            match buckets.iter_mut().find(|(cols, _)| cols == &ev.columns) {
                Some((_, calls)) => *calls += ev.calls,
                None => buckets.push((ev.columns.clone(), ev.calls)),
            }
        }
        for (columns, calls) in buckets {
            let covered = indexes.iter().any(|idx| {
                idx.schema == table.schema
                    && idx.table == table.name
                    && idx.columns.len() >= columns.len()
                    && idx.columns[..columns.len()] == columns[..]
            });
            if covered {
                continue;
            }
            let confidence = (calls as f64 / FULL_CONFIDENCE_CALLS as f64).min(1.0);
            let ddl_table = table_ddl_name(&table.schema, &table.name);
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            findings.push(IndexFinding {
                schema: table.schema.clone(),
                table: table.name.clone(),
                kind: IndexFindingKind::Missing,
                index: None,
                columns,
                supporting_evidence: format!(
                    "{calls} calls seq-scan {} (~{} rows, {:.0}% of scans sequential)",
                    table.name,
                    table.row_estimate,
                    table.seq_scan_ratio() * 100.0
                ),
                confidence,
                recommendation: format!("CREATE INDEX ON {ddl_table} ({column_list})"),
                safe: true,
            });
        }
    }
    findings
}

fn unused_indexes(
    indexes: &[IndexProfile],
    first_seen: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &IndexAuditorSection,
) -> Vec<IndexFinding> {
    let min_age = ChronoDuration::days(config.min_age_days);
    indexes
        .iter()
        .filter(|idx| {
            idx.scans <= config.unused_idx_scan_threshold
                && !idx.is_unique
                && !idx.is_primary
                && !idx.backs_constraint
        })
        .filter(|idx| {
            first_seen
                .get(&index_key(idx))
                .is_some_and(|seen| now.signed_duration_since(*seen) >= min_age)
        })
        .map(|idx| IndexFinding {
            schema: idx.schema.clone(),
            table: idx.table.clone(),
            kind: IndexFindingKind::Unused,
            index: Some(idx.name.clone()),
            columns: idx.columns.clone(),
            supporting_evidence: format!(
                "{} scans recorded, {} bytes on disk",
                idx.scans, idx.size_bytes
            ),
            confidence: 0.9,
            recommendation: format!(
                "review and drop manually: DROP INDEX {}.{}",
                quote_ident(&idx.schema),
                quote_ident(&idx.name)
            ),
            safe: false,
        })
        .collect()
}

fn duplicate_and_redundant(indexes: &[IndexProfile]) -> Vec<IndexFinding> {
    let mut findings = Vec::new();
    let mut by_table: HashMap<(String, String), Vec<&IndexProfile>> = HashMap::new();
    for idx in indexes {
        by_table
            .entry((idx.schema.clone(), idx.table.clone()))
            .or_default()
            .push(idx);
    }
    for group in by_table.values() {
        for (i, a) in group.iter().enumerate() {
            for b in group.iter().skip(i + 1) {
                if a.is_partial || b.is_partial {
                    continue;
                }
                if a.columns == b.columns && a.is_unique == b.is_unique {
                    // Keep the first, flag the second.
                    let (keep, flag) = (a, b);
                    findings.push(IndexFinding {
                        schema: flag.schema.clone(),
                        table: flag.table.clone(),
                        kind: IndexFindingKind::Duplicate,
                        index: Some(flag.name.clone()),
                        columns: flag.columns.clone(),
                        supporting_evidence: format!(
                            "identical column list to {} ({})",
                            keep.name,
                            flag.columns.join(", ")
                        ),
                        confidence: 1.0,
                        recommendation: format!(
                            "duplicate of {}; review and drop one",
                            keep.name
                        ),
                        safe: false,
                    });
                } else {
                    // A strict prefix of a wider index is redundant
                    // unless it enforces uniqueness.
                    for (narrow, wide) in [(a, b), (b, a)] {
                        if !narrow.is_unique
                            && narrow.columns.len() < wide.columns.len()
                            && wide.columns[..narrow.columns.len()] == narrow.columns[..]
                        {
                            findings.push(IndexFinding {
                                schema: narrow.schema.clone(),
                                table: narrow.table.clone(),
                                kind: IndexFindingKind::RedundantPrefix,
                                index: Some(narrow.name.clone()),
                                columns: narrow.columns.clone(),
                                supporting_evidence: format!(
                                    "({}) is a prefix of {} ({})",
                                    narrow.columns.join(", "),
                                    wide.name,
                                    wide.columns.join(", ")
                                ),
                                confidence: 0.8,
                                recommendation: format!(
                                    "covered by {}; review and drop",
                                    wide.name
                                ),
                                safe: false,
                            });
                        }
                    }
                }
            }
        }
    }
    findings
}

fn bloated_indexes(indexes: &[IndexProfile], config: &IndexAuditorSection) -> Vec<IndexFinding> {
    indexes
        .iter()
        .filter(|idx| {
            idx.bloat_estimate > config.bloat_threshold && idx.size_bytes > config.min_bloat_bytes
        })
        .map(|idx| IndexFinding {
            schema: idx.schema.clone(),
            table: idx.table.clone(),
            kind: IndexFindingKind::Bloated,
            index: Some(idx.name.clone()),
            columns: idx.columns.clone(),
            supporting_evidence: format!(
                "estimated {:.0}% wasted of {} bytes",
                idx.bloat_estimate * 100.0,
                idx.size_bytes
            ),
            confidence: 0.6,
            recommendation: format!(
                "REINDEX INDEX CONCURRENTLY {}.{}",
                quote_ident(&idx.schema),
                quote_ident(&idx.name)
            ),
            safe: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IndexAuditorSection {
        IndexAuditorSection::default()
    }

    fn table(name: &str, rows: i64, seq: i64, idx: i64) -> TableProfile {
        TableProfile {
            schema: "public".into(),
            name: name.into(),
            row_estimate: rows,
            total_bytes: 100 * 1024 * 1024,
            heap_bytes: 80 * 1024 * 1024,
            index_bytes: 20 * 1024 * 1024,
            seq_scan_count: seq,
            idx_scan_count: idx,
            hot_update_ratio: 0.0,
            live_tuples: rows,
            dead_tuples: 0,
            mod_since_analyze: 0,
            last_analyze: None,
            last_autoanalyze: None,
        }
    }

    fn index(table: &str, name: &str, columns: &[&str]) -> IndexProfile {
        IndexProfile {
            schema: "public".into(),
            table: table.into(),
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_unique: false,
            is_primary: false,
            is_partial: false,
            predicate: None,
            backs_constraint: false,
            size_bytes: 10 * 1024 * 1024,
            scans: 1000,
            tuples_read: 10_000,
            tuples_fetched: 9_000,
            bloat_estimate: 0.0,
        }
    }

    fn evidence(table: &str, columns: &[&str], calls: i64) -> SeqScanEvidence {
        SeqScanEvidence {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            calls,
            from_plan: true,
        }
    }

    #[test]
    fn empty_schema_yields_no_findings() {
        let findings = audit(&[], &[], &[], &HashMap::new(), Utc::now(), &config());
        assert!(findings.is_empty());
    }

    #[test]
    fn missing_index_from_seq_scan_evidence() {
        let tables = [table("orders", 2_000_000, 5000, 10)];
        let evidence = [evidence("orders", &["status"], 500)];
        let findings = audit(&tables, &[], &evidence, &HashMap::new(), Utc::now(), &config());
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.kind, IndexFindingKind::Missing);
        assert_eq!(f.columns, vec!["status"]);
        assert!(f.confidence >= 0.5);
        assert_eq!(f.recommendation, "CREATE INDEX ON orders (status)");
        assert!(f.safe);
    }

    #[test]
    fn missing_index_suppressed_by_existing_prefix() {
        let tables = [table("orders", 2_000_000, 5000, 10)];
        let indexes = [index("orders", "idx_orders_status_created", &["status", "created_at"])];
        let evidence = [evidence("orders", &["status"], 500)];
        let findings = audit(&tables, &indexes, &evidence, &HashMap::new(), Utc::now(), &config());
        assert!(findings.is_empty());
    }

    #[test]
    fn missing_index_requires_seq_heavy_table() {
        // Index scans dominate: no missing-index finding even with evidence.
        let tables = [table("orders", 2_000_000, 10, 100_000)];
        let evidence = [evidence("orders", &["status"], 500)];
        let findings = audit(&tables, &[], &evidence, &HashMap::new(), Utc::now(), &config());
        assert!(findings.is_empty());
    }

    #[test]
    fn missing_index_confidence_scales_with_calls() {
        let tables = [table("orders", 2_000_000, 5000, 10)];
        let evidence = [evidence("orders", &["status"], 30)];
        let findings = audit(&tables, &[], &evidence, &HashMap::new(), Utc::now(), &config());
        assert!((findings[0].confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn unused_index_needs_age() {
        let mut idx = index("orders", "idx_orders_legacy", &["legacy_col"]);
        idx.scans = 0;
        let indexes = [idx];
        let now = Utc::now();

        // Just observed: too young to flag.
        let mut first_seen = HashMap::new();
        first_seen.insert("public.idx_orders_legacy".to_string(), now);
        let findings = audit(&[], &indexes, &[], &first_seen, now, &config());
        assert!(findings.is_empty());

        // Observed longer than min_age_days: flagged.
        first_seen.insert(
            "public.idx_orders_legacy".to_string(),
            now - ChronoDuration::days(8),
        );
        let findings = audit(&[], &indexes, &[], &first_seen, now, &config());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, IndexFindingKind::Unused);
        assert_eq!(findings[0].index.as_deref(), Some("idx_orders_legacy"));
        assert!(!findings[0].safe);
    }

    #[test]
    fn unused_never_flags_constraint_indexes() {
        let now = Utc::now();
        let old = now - ChronoDuration::days(30);
        let mut pk = index("orders", "orders_pkey", &["id"]);
        pk.scans = 0;
        pk.is_primary = true;
        pk.is_unique = true;
        pk.backs_constraint = true;
        let mut uniq = index("orders", "orders_email_key", &["email"]);
        uniq.scans = 0;
        uniq.is_unique = true;
        uniq.backs_constraint = true;
        let indexes = [pk, uniq];
        let mut first_seen = HashMap::new();
        first_seen.insert("public.orders_pkey".to_string(), old);
        first_seen.insert("public.orders_email_key".to_string(), old);

        let findings = audit(&[], &indexes, &[], &first_seen, now, &config());
        assert!(findings.is_empty());
    }

    #[test]
    fn duplicate_indexes_detected_once() {
        let indexes = [
            index("orders", "idx_a", &["status"]),
            index("orders", "idx_b", &["status"]),
        ];
        let findings = audit(&[], &indexes, &[], &HashMap::new(), Utc::now(), &config());
        let dups: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == IndexFindingKind::Duplicate)
            .collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].index.as_deref(), Some("idx_b"));
        assert!(dups[0].supporting_evidence.contains("idx_a"));
    }

    #[test]
    fn redundant_prefix_detected() {
        let indexes = [
            index("orders", "idx_status", &["status"]),
            index("orders", "idx_status_created", &["status", "created_at"]),
        ];
        let findings = audit(&[], &indexes, &[], &HashMap::new(), Utc::now(), &config());
        let redundant: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == IndexFindingKind::RedundantPrefix)
            .collect();
        assert_eq!(redundant.len(), 1);
        assert_eq!(redundant[0].index.as_deref(), Some("idx_status"));
    }

    #[test]
    fn unique_prefix_is_not_redundant() {
        let mut narrow = index("orders", "orders_code_key", &["code"]);
        narrow.is_unique = true;
        let indexes = [narrow, index("orders", "idx_code_created", &["code", "created_at"])];
        let findings = audit(&[], &indexes, &[], &HashMap::new(), Utc::now(), &config());
        assert!(findings
            .iter()
            .all(|f| f.kind != IndexFindingKind::RedundantPrefix));
    }

    #[test]
    fn partial_indexes_never_duplicate() {
        let mut partial = index("orders", "idx_open", &["status"]);
        partial.is_partial = true;
        partial.predicate = Some("status = 'open'".into());
        let indexes = [partial, index("orders", "idx_status", &["status"])];
        let findings = audit(&[], &indexes, &[], &HashMap::new(), Utc::now(), &config());
        assert!(findings
            .iter()
            .all(|f| f.kind != IndexFindingKind::Duplicate));
    }

    #[test]
    fn bloated_index_over_thresholds() {
        let mut idx = index("orders", "idx_bloat", &["status"]);
        idx.bloat_estimate = 0.45;
        idx.size_bytes = 50 * 1024 * 1024;
        let findings = audit(&[], &[idx], &[], &HashMap::new(), Utc::now(), &config());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, IndexFindingKind::Bloated);
        assert!(findings[0].recommendation.starts_with("REINDEX"));
    }

    #[test]
    fn small_bloated_index_ignored() {
        let mut idx = index("orders", "idx_bloat", &["status"]);
        idx.bloat_estimate = 0.9;
        idx.size_bytes = 1024; // under min_bloat_bytes
        let findings = audit(&[], &[idx], &[], &HashMap::new(), Utc::now(), &config());
        assert!(findings.is_empty());
    }

    #[test]
    fn audit_is_idempotent_on_unchanged_inputs() {
        let tables = [table("orders", 2_000_000, 5000, 10)];
        let mut legacy = index("orders", "idx_orders_legacy", &["legacy_col"]);
        legacy.scans = 0;
        let indexes = [legacy];
        let evidence = [evidence("orders", &["status"], 500)];
        let now = Utc::now();
        let mut first_seen = HashMap::new();
        first_seen.insert(
            "public.idx_orders_legacy".to_string(),
            now - ChronoDuration::days(10),
        );

        let a = audit(&tables, &indexes, &evidence, &first_seen, now, &config());
        let b = audit(&tables, &indexes, &evidence, &first_seen, now, &config());
        let ids_a: Vec<_> = a.iter().map(IndexFinding::identity).collect();
        let ids_b: Vec<_> = b.iter().map(IndexFinding::identity).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.len(), 2); // one missing, one unused
    }

    #[test]
    fn non_public_schema_is_qualified_in_ddl() {
        let mut t = table("events", 2_000_000, 5000, 10);
        t.schema = "analytics".into();
        let evidence = [evidence("events", &["kind"], 200)];
        let findings = audit(&[t], &[], &evidence, &HashMap::new(), Utc::now(), &config());
        assert_eq!(findings[0].recommendation, "CREATE INDEX ON analytics.events (kind)");
    }
}
