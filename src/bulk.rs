//! Bulk-load adapter: routes a batch of rows to the cheapest viable
//! mechanism (per-row inserts, multi-row VALUES, prepared batches via
//! the statement cache, or COPY), retrying transient failures on a
//! fresh session each time.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use rand::Rng;
use serde::Serialize;
use std::mem::discriminant;
use std::time::{Duration, Instant};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tracing::{debug, warn};

use crate::config::BulkSection;
use crate::db::error::{is_permission_denied, DbError, Result};
use crate::db::queries::quote_ident;
use crate::pool::{ExecOptions, Pool, Prepared, Session};

/// PostgreSQL caps bind parameters per statement at u16::MAX.
const MAX_PARAMS_PER_STATEMENT: usize = 65_535;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dynamically typed cell value for bulk jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(v) => v.to_sql(ty, out),
            Self::I32(v) => v.to_sql(ty, out),
            Self::I64(v) => v.to_sql(ty, out),
            Self::F64(v) => v.to_sql(ty, out),
            Self::Text(v) => v.to_sql(ty, out),
            Self::Timestamp(v) => v.to_sql(ty, out),
            Self::Json(v) => v.to_sql(ty, out),
            Self::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Cell values are dynamic; mismatches surface as encode errors.
        true
    }

    to_sql_checked!();
}

impl SqlValue {
    /// Text-format COPY encoding: `\N` for null, control characters and
    /// backslash escaped per the COPY text protocol.
    fn to_copy_text(&self) -> String {
        match self {
            Self::Null => "\\N".to_string(),
            Self::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            Self::I32(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::F64(v) => v.to_string(),
            Self::Text(v) => escape_copy_text(v),
            Self::Timestamp(v) => v.to_rfc3339(),
            Self::Json(v) => escape_copy_text(&v.to_string()),
            Self::Bytes(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\\\x");
                for b in v {
                    out.push_str(&format!("{b:02x}"));
                }
                out
            }
        }
    }
}

fn escape_copy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Server-side conflict handling for insert-style loads.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OnConflict {
    /// Constraint violations fail the job.
    #[default]
    Error,
    Ignore,
    UpdateAll {
        conflict_target: Vec<String>,
    },
    UpdateColumns {
        conflict_target: Vec<String>,
        columns: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMethod {
    SingleInsert,
    MultiValues,
    PreparedBatch,
    CopyFrom,
}

#[derive(Debug, Clone)]
pub struct BulkJob {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub on_conflict: OnConflict,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub rows_loaded: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub method_used: BulkMethod,
    pub retries: u32,
    pub conflicts_skipped: u64,
}

/// Selection rules, first match wins. Jobs in the prepared-batch band
/// whose columns carry mixed value types fall back to multi-VALUES,
/// since one prepared statement cannot serve them.
pub fn choose_method(rows: usize, stable_types: bool) -> BulkMethod {
    match rows {
        0..=49 => BulkMethod::SingleInsert,
        50..=999 => BulkMethod::MultiValues,
        1000..=9999 => {
            if stable_types {
                BulkMethod::PreparedBatch
            } else {
                BulkMethod::MultiValues
            }
        }
        _ => BulkMethod::CopyFrom,
    }
}

/// Whether every column holds one value type across all rows (nulls
/// are compatible with anything).
pub fn stable_types(rows: &[Vec<SqlValue>]) -> bool {
    let Some(first) = rows.first() else {
        return true;
    };
    let mut kinds: Vec<Option<std::mem::Discriminant<SqlValue>>> = vec![None; first.len()];
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if matches!(value, SqlValue::Null) {
                continue;
            }
            let d = discriminant(value);
            match kinds.get_mut(i) {
                Some(slot @ None) => *slot = Some(d),
                Some(Some(existing)) if *existing == d => {}
                _ => return false,
            }
        }
    }
    true
}

/// Renders the `ON CONFLICT` clause for insert-style statements.
pub fn conflict_clause(policy: &OnConflict, columns: &[String]) -> String {
    match policy {
        OnConflict::Error => String::new(),
        OnConflict::Ignore => " ON CONFLICT DO NOTHING".to_string(),
        OnConflict::UpdateAll { conflict_target } => {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !conflict_target.contains(c))
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect();
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                idents(conflict_target),
                updates.join(", ")
            )
        }
        OnConflict::UpdateColumns {
            conflict_target,
            columns: update_columns,
        } => {
            let updates: Vec<String> = update_columns
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect();
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                idents(conflict_target),
                updates.join(", ")
            )
        }
    }
}

fn idents(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)...` for `chunk`
/// rows of `width` columns.
pub fn multi_values_sql(table: &str, columns: &[String], chunk: usize, policy: &OnConflict) -> String {
    let width = columns.len();
    let mut values = Vec::with_capacity(chunk);
    for row in 0..chunk {
        let params: Vec<String> = (0..width).map(|c| format!("${}", row * width + c + 1)).collect();
        values.push(format!("({})", params.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}{}",
        quote_ident(table),
        idents(columns),
        values.join(", "),
        conflict_clause(policy, columns)
    )
}

fn single_insert_sql(table: &str, columns: &[String], policy: &OnConflict) -> String {
    multi_values_sql(table, columns, 1, policy)
}

/// Full-jitter exponential backoff for attempt `n` (0-based).
pub fn backoff_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt)).min(BACKOFF_CAP);
    exp.mul_f64(rng.random_range(0.0..=1.0))
}

pub struct BulkLoader {
    pool: Pool,
    config: BulkSection,
}

impl BulkLoader {
    pub fn new(pool: Pool, config: BulkSection) -> Self {
        Self { pool, config }
    }

    /// Executes the job under a single transaction per attempt.
    /// Transient failures retry with backoff on a fresh session; bad
    /// input and constraint violations fail fast.
    pub async fn load(&self, job: BulkJob) -> Result<BulkResult> {
        validate(&job)?;
        let started = Instant::now();
        if job.rows.is_empty() {
            return Ok(BulkResult {
                rows_loaded: 0,
                bytes: 0,
                elapsed_ms: 0,
                method_used: BulkMethod::SingleInsert,
                retries: 0,
                conflicts_skipped: 0,
            });
        }

        let mut method = choose_method(job.rows.len(), stable_types(&job.rows));
        let mut retries = 0u32;
        loop {
            let attempt_result = self.attempt(&job, method).await;
            match attempt_result {
                Ok((rows_loaded, bytes)) => {
                    return Ok(BulkResult {
                        rows_loaded,
                        bytes,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        method_used: method,
                        retries,
                        conflicts_skipped: job.rows.len() as u64 - rows_loaded,
                    });
                }
                Err(e) => {
                    // A refused COPY stream (typically missing
                    // privilege) downgrades to a prepared batch.
                    if method == BulkMethod::CopyFrom && is_copy_refusal(&e) {
                        warn!(table = %job.table, error = %e, "COPY refused, falling back to prepared batch");
                        method = BulkMethod::PreparedBatch;
                        retries += 1;
                        continue;
                    }
                    if e.is_transient() && retries + 1 < self.config.max_attempts {
                        retries += 1;
                        let delay = backoff_delay(retries - 1, &mut rand::rng());
                        debug!(table = %job.table, retries, ?delay, error = %e, "transient bulk failure, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, job: &BulkJob, method: BulkMethod) -> Result<(u64, u64)> {
        let mut session = self.pool.acquire(ACQUIRE_TIMEOUT).await?;
        session.begin().await?;
        let result = match method {
            BulkMethod::SingleInsert => self.insert_rows(&mut session, job, Prepared::Auto).await,
            BulkMethod::PreparedBatch => self.insert_rows(&mut session, job, Prepared::Force).await,
            BulkMethod::MultiValues => self.multi_values(&mut session, job).await,
            BulkMethod::CopyFrom => self.copy_from(&mut session, job).await,
        };
        match result {
            Ok(out) => {
                session.commit().await?;
                Ok(out)
            }
            Err(e) => {
                // Dropping a session mid-transaction discards it, but a
                // clean rollback lets the connection be reused.
                if session.rollback().await.is_err() {
                    session.flag_error();
                }
                Err(e)
            }
        }
    }

    async fn insert_rows(
        &self,
        session: &mut Session,
        job: &BulkJob,
        prepared: Prepared,
    ) -> Result<(u64, u64)> {
        let sql = single_insert_sql(&job.table, &job.columns, &job.on_conflict);
        let options = ExecOptions {
            prepared,
            ..ExecOptions::default()
        };
        let mut loaded = 0u64;
        let mut bytes = 0u64;
        for row in &job.rows {
            let params: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            loaded += session.exec(&sql, &params, options).await?;
            bytes += row.iter().map(|v| v.to_copy_text().len() as u64).sum::<u64>();
        }
        Ok((loaded, bytes))
    }

    async fn multi_values(&self, session: &mut Session, job: &BulkJob) -> Result<(u64, u64)> {
        let width = job.columns.len();
        let chunk_rows = self
            .config
            .values_per_statement
            .min(MAX_PARAMS_PER_STATEMENT / width.max(1))
            .max(1);
        let mut loaded = 0u64;
        let mut bytes = 0u64;
        for chunk in job.rows.chunks(chunk_rows) {
            let sql = multi_values_sql(&job.table, &job.columns, chunk.len(), &job.on_conflict);
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flatten()
                .map(|v| v as &(dyn ToSql + Sync))
                .collect();
            loaded += session.exec(&sql, &params, ExecOptions::default()).await?;
            bytes += chunk
                .iter()
                .flatten()
                .map(|v| v.to_copy_text().len() as u64)
                .sum::<u64>();
        }
        Ok((loaded, bytes))
    }

    async fn copy_from(&self, session: &mut Session, job: &BulkJob) -> Result<(u64, u64)> {
        let direct = job.on_conflict == OnConflict::Error;
        let copy_target = if direct {
            quote_ident(&job.table)
        } else {
            // Conflict policies route through a session-temporary
            // staging table and a single INSERT ... SELECT.
            let staging = format!("{}_load", job.table);
            session
                .batch(&format!(
                    "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
                    quote_ident(&staging),
                    quote_ident(&job.table)
                ))
                .await?;
            quote_ident(&staging)
        };

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN",
            copy_target,
            idents(&job.columns)
        );
        let sink = session.copy_in(&copy_sql).await?;
        futures::pin_mut!(sink);

        let mut bytes = 0u64;
        for chunk in job.rows.chunks(self.config.copy_chunk_rows) {
            let mut buf = String::new();
            for row in chunk {
                let line: Vec<String> = row.iter().map(SqlValue::to_copy_text).collect();
                buf.push_str(&line.join("\t"));
                buf.push('\n');
            }
            bytes += buf.len() as u64;
            sink.send(Bytes::from(buf)).await.map_err(DbError::Postgres)?;
        }
        let copied = sink.finish().await.map_err(DbError::Postgres)?;

        if direct {
            return Ok((copied, bytes));
        }
        let insert_sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}{}",
            quote_ident(&job.table),
            idents(&job.columns),
            idents(&job.columns),
            copy_target,
            conflict_clause(&job.on_conflict, &job.columns)
        );
        let loaded = session.exec(&insert_sql, &[], ExecOptions::default()).await?;
        Ok((loaded, bytes))
    }
}

fn validate(job: &BulkJob) -> Result<()> {
    if job.table.is_empty() {
        return Err(DbError::BadInput {
            message: "bulk job has no target table".into(),
        });
    }
    if job.columns.is_empty() {
        return Err(DbError::BadInput {
            message: "bulk job has no columns".into(),
        });
    }
    for (i, row) in job.rows.iter().enumerate() {
        if row.len() != job.columns.len() {
            return Err(DbError::BadInput {
                message: format!(
                    "row {i} has {} values but {} columns were declared",
                    row.len(),
                    job.columns.len()
                ),
            });
        }
    }
    Ok(())
}

fn is_copy_refusal(e: &DbError) -> bool {
    match e {
        DbError::Postgres(e) | DbError::Query { source: e, .. } => is_permission_denied(e),
        DbError::PermissionDenied { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_rows(n: usize) -> Vec<Vec<SqlValue>> {
        (0..n)
            .map(|i| vec![SqlValue::I64(i as i64), SqlValue::Text(format!("row{i}"))])
            .collect()
    }

    #[test]
    fn method_selection_thresholds() {
        assert_eq!(choose_method(20, true), BulkMethod::SingleInsert);
        assert_eq!(choose_method(49, true), BulkMethod::SingleInsert);
        assert_eq!(choose_method(50, true), BulkMethod::MultiValues);
        assert_eq!(choose_method(500, true), BulkMethod::MultiValues);
        assert_eq!(choose_method(999, true), BulkMethod::MultiValues);
        assert_eq!(choose_method(1000, true), BulkMethod::PreparedBatch);
        assert_eq!(choose_method(5000, true), BulkMethod::PreparedBatch);
        assert_eq!(choose_method(9999, true), BulkMethod::PreparedBatch);
        assert_eq!(choose_method(10_000, true), BulkMethod::CopyFrom);
        assert_eq!(choose_method(50_000, true), BulkMethod::CopyFrom);
    }

    #[test]
    fn unstable_types_demote_prepared_batch() {
        assert_eq!(choose_method(5000, false), BulkMethod::MultiValues);
        // COPY is typeless text; stability does not matter there.
        assert_eq!(choose_method(50_000, false), BulkMethod::CopyFrom);
    }

    #[test]
    fn stable_types_allows_nulls() {
        let rows = vec![
            vec![SqlValue::I64(1), SqlValue::Text("a".into())],
            vec![SqlValue::Null, SqlValue::Text("b".into())],
            vec![SqlValue::I64(3), SqlValue::Null],
        ];
        assert!(stable_types(&rows));
    }

    #[test]
    fn mixed_types_in_one_column_detected() {
        let rows = vec![
            vec![SqlValue::I64(1)],
            vec![SqlValue::Text("oops".into())],
        ];
        assert!(!stable_types(&rows));
    }

    #[test]
    fn conflict_clause_variants() {
        let columns: Vec<String> = vec!["id".into(), "name".into(), "total".into()];
        assert_eq!(conflict_clause(&OnConflict::Error, &columns), "");
        assert_eq!(
            conflict_clause(&OnConflict::Ignore, &columns),
            " ON CONFLICT DO NOTHING"
        );
        assert_eq!(
            conflict_clause(
                &OnConflict::UpdateAll {
                    conflict_target: vec!["id".into()]
                },
                &columns
            ),
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, total = EXCLUDED.total"
        );
        assert_eq!(
            conflict_clause(
                &OnConflict::UpdateColumns {
                    conflict_target: vec!["id".into()],
                    columns: vec!["total".into()]
                },
                &columns
            ),
            " ON CONFLICT (id) DO UPDATE SET total = EXCLUDED.total"
        );
    }

    #[test]
    fn multi_values_sql_numbers_params_row_major() {
        let columns: Vec<String> = vec!["a".into(), "b".into()];
        let sql = multi_values_sql("t", &columns, 3, &OnConflict::Error);
        assert_eq!(
            sql,
            "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4), ($5, $6)"
        );
    }

    #[test]
    fn single_insert_sql_is_one_row() {
        let columns: Vec<String> = vec!["a".into()];
        assert_eq!(
            single_insert_sql("t", &columns, &OnConflict::Ignore),
            "INSERT INTO t (a) VALUES ($1) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn copy_text_escaping() {
        assert_eq!(SqlValue::Null.to_copy_text(), "\\N");
        assert_eq!(SqlValue::Bool(true).to_copy_text(), "t");
        assert_eq!(SqlValue::I64(-7).to_copy_text(), "-7");
        assert_eq!(
            SqlValue::Text("a\tb\nc\\d".into()).to_copy_text(),
            "a\\tb\\nc\\\\d"
        );
        assert_eq!(SqlValue::Bytes(vec![0xde, 0xad]).to_copy_text(), "\\\\xdead");
    }

    #[test]
    fn validate_rejects_column_count_mismatch() {
        let job = BulkJob {
            table: "t".into(),
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![SqlValue::I64(1)]],
            on_conflict: OnConflict::Error,
        };
        let err = validate(&job).unwrap_err();
        assert!(matches!(err, DbError::BadInput { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn validate_accepts_well_formed_job() {
        let job = BulkJob {
            table: "t".into(),
            columns: vec!["a".into(), "b".into()],
            rows: text_rows(10),
            on_conflict: OnConflict::Error,
        };
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let mut rng = rand::rng();
        for attempt in 0..10 {
            let delay = backoff_delay(attempt, &mut rng);
            assert!(delay <= BACKOFF_CAP, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn method_used_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&BulkMethod::PreparedBatch).unwrap(),
            "\"prepared_batch\""
        );
        assert_eq!(
            serde_json::to_string(&BulkMethod::CopyFrom).unwrap(),
            "\"copy_from\""
        );
    }
}
