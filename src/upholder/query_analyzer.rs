//! Query analyzer: turns `pg_stat_statements` rows and sampled plans
//! into actionable issues.

use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::QueryAnalyzerSection;
use crate::db::error::{DbError, Result};
use crate::db::models::QueryStat;
use crate::db::queries;
use crate::pool::Session;
use crate::scheduler::Shutdown;
use crate::statement_cache::StatementKey;
use crate::upholder::plan::{parse_explain, Plan};
use crate::upholder::report::{QueryIssue, QueryIssueKind, Severity};

/// Server-side bound on sampled EXPLAIN planning time.
const EXPLAIN_TIMEOUT: &str = "SET statement_timeout = '5s'";

/// A slow mean this many times over the threshold escalates the issue
/// from warning to critical.
const CRITICAL_FACTOR: f64 = 10.0;

const HIGH_VARIANCE_RATIO: f64 = 5.0;
const LOW_CACHE_LOCALITY: f64 = 0.5;

pub struct QueryAnalyzer {
    config: QueryAnalyzerSection,
    /// `(calls, total_ms)` per queryid from the previous pass. Counters
    /// moving backwards signal a stats reset, which re-baselines.
    baseline: HashMap<i64, (i64, f64)>,
    missing_logged: bool,
}

/// Seq-scan observation handed to the index auditor: which table, which
/// filter columns, how many calls back it up.
#[derive(Debug, Clone)]
pub struct SeqScanEvidence {
    pub table: String,
    pub columns: Vec<String>,
    pub calls: i64,
    /// True when derived from a sampled plan, false when recovered from
    /// the statement text because EXPLAIN was skipped.
    pub from_plan: bool,
}

/// One analyzer pass's output.
#[derive(Debug, Default)]
pub struct QueryAnalysis {
    pub issues: Vec<QueryIssue>,
    pub seq_scans: Vec<SeqScanEvidence>,
}

impl QueryAnalyzer {
    pub fn new(config: QueryAnalyzerSection) -> Self {
        Self {
            config,
            baseline: HashMap::new(),
            missing_logged: false,
        }
    }

    /// One analyzer pass. Per-statement EXPLAIN failures are swallowed;
    /// a missing extension degrades to a single info issue.
    pub async fn run_pass(
        &mut self,
        session: &mut Session,
        shutdown: &Shutdown,
    ) -> Result<QueryAnalysis> {
        let stats = match queries::fetch_query_stats(
            session,
            self.config.min_calls,
            self.config.top_n,
        )
        .await
        {
            Ok(stats) => stats,
            Err(DbError::ExtensionMissing { name }) => {
                if !self.missing_logged {
                    warn!(extension = name, "extension missing, query analysis disabled");
                    self.missing_logged = true;
                }
                return Ok(QueryAnalysis {
                    issues: vec![extension_missing_issue(name)],
                    seq_scans: Vec::new(),
                });
            }
            Err(e) => return Err(e),
        };
        self.missing_logged = false;

        let stats: Vec<QueryStat> = stats
            .into_iter()
            .filter(|s| {
                !self
                    .config
                    .ignore_prefixes
                    .iter()
                    .any(|p| s.sample_text.trim_start().starts_with(p.as_str()))
            })
            .collect();
        self.reconcile_baseline(&stats);

        let row_estimates = queries::fetch_table_row_estimates(session).await?;

        session.batch(EXPLAIN_TIMEOUT).await?;
        let mut analysis = QueryAnalysis::default();
        for stat in &stats {
            if shutdown.is_cancelled() {
                break;
            }
            let plan = if rand::rng().random_bool(self.config.explain_sample_rate.clamp(0.0, 1.0)) {
                self.sample_plan(session, stat).await
            } else {
                None
            };
            match plan.as_ref() {
                Some(plan) => {
                    for scan in &plan.seq_scans {
                        analysis.seq_scans.push(SeqScanEvidence {
                            table: scan.relation.clone(),
                            columns: scan.filter_columns.clone(),
                            calls: stat.calls,
                            from_plan: true,
                        });
                    }
                }
                // EXPLAIN skipped: recover the table and filter columns
                // from the statement text for the index auditor.
                None => {
                    if let Some((table, pairs)) = extract_param_columns(&stat.sample_text) {
                        if !pairs.is_empty() {
                            analysis.seq_scans.push(SeqScanEvidence {
                                table,
                                columns: pairs.into_iter().map(|(_, c)| c).collect(),
                                calls: stat.calls,
                                from_plan: false,
                            });
                        }
                    }
                }
            }
            analysis
                .issues
                .extend(classify(stat, plan.as_ref(), &row_estimates, &self.config));
        }
        session.batch("RESET statement_timeout").await?;
        Ok(analysis)
    }

    fn reconcile_baseline(&mut self, stats: &[QueryStat]) {
        let reset_detected = stats.iter().any(|s| {
            self.baseline
                .get(&s.queryid)
                .is_some_and(|(calls, total)| s.calls < *calls || s.total_ms < *total)
        });
        if reset_detected {
            debug!("pg_stat_statements counters moved backwards, re-baselining");
            self.baseline.clear();
        }
        for s in stats {
            self.baseline.insert(s.queryid, (s.calls, s.total_ms));
        }
    }

    /// Best-effort plan sample: reconstructs an executable statement by
    /// substituting representative literals for placeholders, then runs
    /// plain EXPLAIN. Statements that cannot be made executable are
    /// skipped; EXPLAIN ANALYZE is never used.
    async fn sample_plan(&self, session: &mut Session, stat: &QueryStat) -> Option<Plan> {
        let text = match reconstruct_statement(session, &stat.sample_text).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                debug!(queryid = stat.queryid, error = %e, "literal substitution failed");
                return None;
            }
        };
        match queries::explain_json(session, &text).await {
            Ok(json) => parse_explain(&json),
            Err(e) => {
                debug!(queryid = stat.queryid, error = %e, "explain failed, skipping plan");
                None
            }
        }
    }
}

fn extension_missing_issue(name: &str) -> QueryIssue {
    QueryIssue {
        queryid: 0,
        fingerprint: String::new(),
        kind: QueryIssueKind::ExtensionMissing,
        severity: Severity::Info,
        calls: 0,
        mean_ms: 0.0,
        recommendation: format!(
            "install and preload the {name} extension to enable query analysis"
        ),
    }
}

/// Pure classification of one statement. Emits one issue per matching
/// kind so reports enumerate every applicable pathology.
pub fn classify(
    stat: &QueryStat,
    plan: Option<&Plan>,
    row_estimates: &HashMap<String, i64>,
    config: &QueryAnalyzerSection,
) -> Vec<QueryIssue> {
    let fingerprint = StatementKey::new(&stat.sample_text).as_str().to_string();
    let mut issues = Vec::new();
    let mut push = |kind: QueryIssueKind, severity: Severity, recommendation: String| {
        issues.push(QueryIssue {
            queryid: stat.queryid,
            fingerprint: fingerprint.clone(),
            kind,
            severity,
            calls: stat.calls,
            mean_ms: stat.mean_ms,
            recommendation,
        });
    };

    if stat.mean_ms >= config.slow_mean_ms {
        let severity = if stat.mean_ms >= config.slow_mean_ms * CRITICAL_FACTOR {
            Severity::Critical
        } else {
            Severity::Warn
        };
        push(
            QueryIssueKind::SlowMean,
            severity,
            format!(
                "mean execution time {:.1}ms exceeds the {:.0}ms threshold; review the plan and indexes",
                stat.mean_ms, config.slow_mean_ms
            ),
        );
    }

    if let Some(plan) = plan {
        for scan in &plan.seq_scans {
            let rows = row_estimates.get(&scan.relation).copied().unwrap_or(0);
            if rows > config.seq_scan_threshold_rows {
                push(
                    QueryIssueKind::SeqScanOnLargeTable,
                    Severity::Critical,
                    format!(
                        "sequential scan over {} (~{rows} rows); an index on ({}) would avoid it",
                        scan.relation,
                        scan.filter_columns.join(", ")
                    ),
                );
            }
        }
    }

    if stat.cache_locality() < LOW_CACHE_LOCALITY {
        push(
            QueryIssueKind::PoorCacheLocality,
            Severity::Warn,
            format!(
                "only {:.0}% of block reads hit the buffer cache; the working set may not fit shared_buffers",
                stat.cache_locality() * 100.0
            ),
        );
    }

    if stat.variance_ratio() > HIGH_VARIANCE_RATIO {
        push(
            QueryIssueKind::HighVariance,
            Severity::Info,
            "execution time varies widely between runs; look for lock waits or plan flips".to_string(),
        );
    }

    if is_unparameterized(&stat.sample_text) {
        push(
            QueryIssueKind::Unparameterized,
            Severity::Warn,
            "statement embeds literal values; use bind parameters so plans and statistics aggregate".to_string(),
        );
    }

    issues
}

/// Detects literal values in comparison positions where a placeholder
/// would be expected. DML/SELECT only; utility statements are exempt.
pub fn is_unparameterized(sql: &str) -> bool {
    static LITERAL_RE: OnceLock<Regex> = OnceLock::new();
    let trimmed = sql.trim_start();
    let head = trimmed.get(..6).unwrap_or("").to_ascii_uppercase();
    if !matches!(head.as_str(), "SELECT" | "INSERT" | "UPDATE" | "DELETE") {
        return false;
    }
    let re = LITERAL_RE.get_or_init(|| {
        Regex::new(r#"(?i)(=|<>|<=|>=|<|>|\bIN\s*\()\s*('[^']*'|\d+(?:\.\d+)?)"#)
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    re.is_match(trimmed)
}

static PARAM_PREDICATE_RE: OnceLock<Regex> = OnceLock::new();
static FROM_RE: OnceLock<Regex> = OnceLock::new();
static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

/// Maps `column op $N` predicates in the statement text. Returns the
/// first FROM relation and `(param, column)` pairs.
pub fn extract_param_columns(sql: &str) -> Option<(String, Vec<(u32, String)>)> {
    let from_re = FROM_RE.get_or_init(|| {
        Regex::new(r"(?i)\bFROM\s+([a-zA-Z_][a-zA-Z0-9_.]*)")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    let table = from_re.captures(sql)?.get(1)?.as_str();
    // Strip a schema qualifier; pg_stats is looked up by bare name.
    let table = table.rsplit('.').next().unwrap_or(table).to_string();

    let re = PARAM_PREDICATE_RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z_][a-zA-Z0-9_]*)\s*(?:=|<>|<=|>=|<|>)\s*\$(\d+)")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    let mut pairs = Vec::new();
    for cap in re.captures_iter(sql) {
        let column = cap[1].to_string();
        if let Ok(param) = cap[2].parse::<u32>() {
            pairs.push((param, column));
        }
    }
    Some((table, pairs))
}

/// Distinct `$N` placeholders appearing in the statement.
pub fn placeholders(sql: &str) -> Vec<u32> {
    let re = PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\$(\d+)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    let mut params: Vec<u32> = re
        .captures_iter(sql)
        .filter_map(|cap| cap[1].parse().ok())
        .collect();
    params.sort_unstable();
    params.dedup();
    params
}

/// Quotes a representative literal for substitution based on the
/// column's declared type.
pub fn quote_literal(value: &str, data_type: &str) -> String {
    let numeric = matches!(
        data_type,
        "smallint" | "integer" | "bigint" | "real" | "double precision" | "numeric" | "oid"
    ) || data_type.starts_with("numeric(");
    if numeric && value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Replaces each `$N` with its representative literal. Callers must
/// have verified that every placeholder has a substitution.
pub fn apply_substitutions(sql: &str, literals: &HashMap<u32, String>) -> String {
    let re = PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\$(\d+)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    re.replace_all(sql, |cap: &regex::Captures<'_>| {
        cap[1]
            .parse::<u32>()
            .ok()
            .and_then(|n| literals.get(&n).cloned())
            .unwrap_or_else(|| cap[0].to_string())
    })
    .into_owned()
}

/// Builds an executable statement for plan sampling. Statements without
/// placeholders pass through; otherwise every placeholder must resolve
/// to a most-common-value literal or the statement is skipped (`None`).
async fn reconstruct_statement(session: &mut Session, sql: &str) -> Result<Option<String>> {
    let params = placeholders(sql);
    if params.is_empty() {
        return Ok(Some(sql.to_string()));
    }
    let Some((table, pairs)) = extract_param_columns(sql) else {
        return Ok(None);
    };
    let wanted: Vec<String> = pairs.iter().map(|(_, c)| c.clone()).collect();
    if wanted.is_empty() {
        return Ok(None);
    }
    let stats = queries::fetch_column_stats(session, &table, &wanted).await?;

    let mut literals: HashMap<u32, String> = HashMap::new();
    for (param, column) in &pairs {
        let Some(stat) = stats.iter().find(|s| &s.column == column) else {
            return Ok(None);
        };
        let Some(ref value) = stat.most_common else {
            return Ok(None);
        };
        literals.insert(*param, quote_literal(value, &stat.data_type));
    }
    if params.iter().any(|p| !literals.contains_key(p)) {
        return Ok(None);
    }
    Ok(Some(apply_substitutions(sql, &literals)))
}
