//! SQL for the diagnostic catalog reads, plus the fetch functions that
//! map rows into the typed models. All statements here are read-only
//! except `run_analyze`, which the orchestrator gates behind its safety
//! flags.

use chrono::{DateTime, Utc};

use super::error::{is_undefined_table, DbError, Result};
use super::models::{
    CacheCounters, ColumnStats, DetectedExtensions, IndexProfile, QueryStat, ServerInfo,
    TableProfile,
};
use crate::pool::Session;

/// Re-wraps a driver error with the calling site, keeping other kinds
/// (pool, cancellation) untouched.
fn ctx(context: &'static str) -> impl FnOnce(DbError) -> DbError {
    move |e| match e {
        DbError::Postgres(source) => DbError::Query { context, source },
        other => other,
    }
}

const SERVER_INFO_SQL: &str = "
SELECT version() AS version, pg_postmaster_start_time() AS start_time
";

const EXTENSIONS_SQL: &str = "
SELECT extname FROM pg_extension
WHERE extname IN ('pg_stat_statements', 'pg_buffercache')
";

/// Column naming for `pg_stat_statements` across server versions:
/// PG13+ renamed `total_time` to `total_exec_time`; PG17 moved the
/// block timing columns to `shared_blk_*_time`. PG13 is the floor here
/// so only the exec-time spelling is emitted, but the helper stays
/// version-driven for when 17-specific columns are needed.
fn stat_statements_sql(top_n: usize) -> String {
    format!(
        "SELECT
    COALESCE(queryid, 0) AS queryid,
    query,
    COALESCE(calls, 0) AS calls,
    COALESCE(total_exec_time, 0) AS total_ms,
    COALESCE(mean_exec_time, 0) AS mean_ms,
    COALESCE(min_exec_time, 0) AS min_ms,
    COALESCE(max_exec_time, 0) AS max_ms,
    COALESCE(rows, 0) AS rows,
    COALESCE(shared_blks_hit, 0) AS shared_blks_hit,
    COALESCE(shared_blks_read, 0) AS shared_blks_read
FROM pg_stat_statements
WHERE calls >= $1 AND query IS NOT NULL
ORDER BY mean_exec_time DESC
LIMIT {top_n}"
    )
}

const TABLE_PROFILES_SQL: &str = "
SELECT
    s.schemaname AS schema,
    s.relname AS name,
    COALESCE(c.reltuples, 0)::bigint AS row_estimate,
    COALESCE(pg_total_relation_size(s.relid), 0) AS total_bytes,
    COALESCE(pg_table_size(s.relid), 0) AS heap_bytes,
    COALESCE(pg_indexes_size(s.relid), 0) AS index_bytes,
    COALESCE(s.seq_scan, 0) AS seq_scan_count,
    COALESCE(s.idx_scan, 0) AS idx_scan_count,
    (CASE WHEN COALESCE(s.n_tup_upd, 0) > 0
          THEN COALESCE(s.n_tup_hot_upd, 0)::float8 / s.n_tup_upd
          ELSE 0 END) AS hot_update_ratio,
    COALESCE(s.n_live_tup, 0) AS live_tuples,
    COALESCE(s.n_dead_tup, 0) AS dead_tuples,
    COALESCE(s.n_mod_since_analyze, 0) AS mod_since_analyze,
    s.last_analyze,
    s.last_autoanalyze
FROM pg_stat_user_tables s
JOIN pg_class c ON c.oid = s.relid
WHERE s.schemaname = ANY($1)
  AND pg_total_relation_size(s.relid) >= $2
ORDER BY pg_total_relation_size(s.relid) DESC
LIMIT $3
";

const INDEX_PROFILES_SQL: &str = "
SELECT
    s.schemaname AS schema,
    s.relname AS table_name,
    s.indexrelname AS index_name,
    COALESCE((
        SELECT array_agg(a.attname ORDER BY k.ord)
        FROM unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
        WHERE k.attnum > 0
    ), '{}') AS columns,
    i.indisunique AS is_unique,
    i.indisprimary AS is_primary,
    i.indpred IS NOT NULL AS is_partial,
    pg_get_expr(i.indpred, i.indrelid) AS predicate,
    EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = i.indexrelid)
        AS backs_constraint,
    COALESCE(pg_relation_size(s.indexrelid), 0) AS size_bytes,
    COALESCE(s.idx_scan, 0) AS scans,
    COALESCE(s.idx_tup_read, 0) AS tuples_read,
    COALESCE(s.idx_tup_fetch, 0) AS tuples_fetched
FROM pg_stat_user_indexes s
JOIN pg_index i ON i.indexrelid = s.indexrelid
WHERE s.schemaname = ANY($1)
  AND i.indisvalid
ORDER BY s.relname, s.indexrelname
";

/// Statistical index bloat estimate: expected size from `pg_stats`
/// average key widths (with B-tree overhead ~1.3x) against the actual
/// relation size. Cheap and advisory; pgstattuple would be exact but
/// needs the extension.
const INDEX_BLOAT_SQL: &str = "
WITH index_stats AS (
    SELECT
        sui.schemaname,
        sui.indexrelname AS index_name,
        pg_relation_size(sui.indexrelid) AS index_size,
        c.reltuples AS table_tuples,
        COALESCE(
            (SELECT SUM(COALESCE(st.avg_width, 8))
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             LEFT JOIN pg_stats st ON st.schemaname = sui.schemaname
                                   AND st.tablename = sui.relname
                                   AND st.attname = a.attname
             WHERE i.indexrelid = sui.indexrelid),
            24
        ) + 8 AS est_idx_tuple_size
    FROM pg_stat_user_indexes sui
    JOIN pg_class c ON c.oid = sui.relid
    WHERE sui.schemaname = ANY($1)
      AND pg_relation_size(sui.indexrelid) > $2
      AND c.reltuples > 0
)
SELECT
    schemaname AS schema,
    index_name,
    LEAST(1.0, GREATEST(0.0,
        (index_size - GREATEST(8192, (table_tuples * est_idx_tuple_size * 1.3)))::float8
        / NULLIF(index_size, 0)))::float8 AS bloat_fraction
FROM index_stats
";

const TABLE_ROW_ESTIMATES_SQL: &str = "
SELECT c.relname AS name, COALESCE(c.reltuples, 0)::bigint AS row_estimate
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind = 'r'
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
";

const HEAP_CACHE_SQL: &str = "
SELECT
    COALESCE(blks_hit, 0) AS heap_blks_hit,
    COALESCE(blks_read, 0) AS heap_blks_read
FROM pg_stat_database
WHERE datname = current_database()
";

const INDEX_CACHE_SQL: &str = "
SELECT
    COALESCE(SUM(idx_blks_hit), 0)::bigint AS idx_blks_hit,
    COALESCE(SUM(idx_blks_read), 0)::bigint AS idx_blks_read
FROM pg_statio_user_indexes
";

const BGWRITER_SQL: &str = "
SELECT COALESCE(maxwritten_clean, 0) AS maxwritten_clean
FROM pg_stat_bgwriter
";

const BUFFERCACHE_SQL: &str = "
SELECT
    COUNT(*) FILTER (WHERE relfilenode IS NOT NULL)::bigint AS buffers_used,
    COUNT(*)::bigint AS buffers_total
FROM pg_buffercache
";

const COLUMN_STATS_SQL: &str = "
SELECT
    tablename AS table_name,
    attname AS column_name,
    ((ps.most_common_vals::text)::text[])[1] AS most_common,
    format_type(at.atttypid, at.atttypmod) AS data_type
FROM pg_stats ps
JOIN pg_class c ON c.relname = ps.tablename
JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = ps.schemaname
JOIN pg_attribute at ON at.attrelid = c.oid AND at.attname = ps.attname
WHERE ps.tablename = $1 AND ps.attname = ANY($2)
";

pub async fn fetch_server_info(session: &mut Session) -> Result<ServerInfo> {
    let row = session
        .query_one(SERVER_INFO_SQL, &[])
        .await
        .map_err(ctx("fetch_server_info"))?;
    let version: String = row.get("version");
    let start_time: DateTime<Utc> = row.get("start_time");
    let extensions = detect_extensions(session).await;
    Ok(ServerInfo {
        version,
        start_time,
        extensions,
    })
}

pub async fn detect_extensions(session: &mut Session) -> DetectedExtensions {
    let Ok(rows) = session.query(EXTENSIONS_SQL, &[]).await else {
        return DetectedExtensions::default();
    };
    let mut ext = DetectedExtensions::default();
    for row in rows {
        let name: String = row.get("extname");
        match name.as_str() {
            "pg_stat_statements" => ext.pg_stat_statements = true,
            "pg_buffercache" => ext.pg_buffercache = true,
            _ => {}
        }
    }
    ext
}

/// Top statements by mean execution time. A missing view maps to
/// [`DbError::ExtensionMissing`] so the analyzer can degrade cleanly.
pub async fn fetch_query_stats(
    session: &mut Session,
    min_calls: i64,
    top_n: usize,
) -> Result<Vec<QueryStat>> {
    let sql = stat_statements_sql(top_n);
    let rows = match session.query(&sql, &[&min_calls]).await {
        Ok(rows) => rows,
        Err(DbError::Postgres(e)) if is_undefined_table(&e) => {
            return Err(DbError::ExtensionMissing {
                name: "pg_stat_statements",
            });
        }
        Err(e) => return Err(ctx("fetch_query_stats")(e)),
    };
    Ok(rows
        .into_iter()
        .map(|row| QueryStat {
            queryid: row.get("queryid"),
            sample_text: row.get("query"),
            calls: row.get("calls"),
            total_ms: row.get("total_ms"),
            mean_ms: row.get("mean_ms"),
            min_ms: row.get("min_ms"),
            max_ms: row.get("max_ms"),
            rows: row.get("rows"),
            shared_blks_hit: row.get("shared_blks_hit"),
            shared_blks_read: row.get("shared_blks_read"),
        })
        .collect())
}

pub async fn fetch_table_profiles(
    session: &mut Session,
    schemas: &[String],
    min_table_bytes: i64,
    max_tables: i64,
) -> Result<Vec<TableProfile>> {
    let rows = session
        .query(TABLE_PROFILES_SQL, &[&schemas, &min_table_bytes, &max_tables])
        .await
        .map_err(ctx("fetch_table_profiles"))?;
    Ok(rows
        .into_iter()
        .map(|row| TableProfile {
            schema: row.get("schema"),
            name: row.get("name"),
            row_estimate: row.get("row_estimate"),
            total_bytes: row.get("total_bytes"),
            heap_bytes: row.get("heap_bytes"),
            index_bytes: row.get("index_bytes"),
            seq_scan_count: row.get("seq_scan_count"),
            idx_scan_count: row.get("idx_scan_count"),
            hot_update_ratio: row.get("hot_update_ratio"),
            live_tuples: row.get("live_tuples"),
            dead_tuples: row.get("dead_tuples"),
            mod_since_analyze: row.get("mod_since_analyze"),
            last_analyze: row.get("last_analyze"),
            last_autoanalyze: row.get("last_autoanalyze"),
        })
        .collect())
}

pub async fn fetch_index_profiles(
    session: &mut Session,
    schemas: &[String],
) -> Result<Vec<IndexProfile>> {
    let rows = session
        .query(INDEX_PROFILES_SQL, &[&schemas])
        .await
        .map_err(ctx("fetch_index_profiles"))?;
    let mut profiles: Vec<IndexProfile> = rows
        .into_iter()
        .map(|row| IndexProfile {
            schema: row.get("schema"),
            table: row.get("table_name"),
            name: row.get("index_name"),
            columns: row.get("columns"),
            is_unique: row.get("is_unique"),
            is_primary: row.get("is_primary"),
            is_partial: row.get("is_partial"),
            predicate: row.get("predicate"),
            backs_constraint: row.get("backs_constraint"),
            size_bytes: row.get("size_bytes"),
            scans: row.get("scans"),
            tuples_read: row.get("tuples_read"),
            tuples_fetched: row.get("tuples_fetched"),
            bloat_estimate: 0.0,
        })
        .collect();

    // Fill in statistical bloat estimates; failure here degrades to
    // zero estimates rather than failing the enumeration.
    let min_size = 65_536i64;
    match session.query(INDEX_BLOAT_SQL, &[&schemas, &min_size]).await {
        Ok(rows) => {
            for row in rows {
                let schema: String = row.get("schema");
                let name: String = row.get("index_name");
                let fraction: Option<f64> = row.get("bloat_fraction");
                if let Some(p) = profiles
                    .iter_mut()
                    .find(|p| p.schema == schema && p.name == name)
                {
                    p.bloat_estimate = fraction.unwrap_or(0.0);
                }
            }
        }
        Err(e) => tracing::debug!(error = %e, "index bloat estimate unavailable"),
    }
    Ok(profiles)
}

pub async fn fetch_cache_counters(
    session: &mut Session,
    has_buffercache: bool,
) -> Result<CacheCounters> {
    let heap = session
        .query_one(HEAP_CACHE_SQL, &[])
        .await
        .map_err(ctx("fetch_cache_counters"))?;
    let idx = session
        .query_one(INDEX_CACHE_SQL, &[])
        .await
        .map_err(ctx("fetch_cache_counters"))?;
    let bgw = session
        .query_one(BGWRITER_SQL, &[])
        .await
        .map_err(ctx("fetch_cache_counters"))?;

    let (buffers_used, buffers_total) = if has_buffercache {
        match session.query_one(BUFFERCACHE_SQL, &[]).await {
            Ok(row) => (row.get("buffers_used"), row.get("buffers_total")),
            Err(_) => (0, 0),
        }
    } else {
        (0, 0)
    };

    Ok(CacheCounters {
        heap_blks_hit: heap.get("heap_blks_hit"),
        heap_blks_read: heap.get("heap_blks_read"),
        idx_blks_hit: idx.get("idx_blks_hit"),
        idx_blks_read: idx.get("idx_blks_read"),
        buffers_used,
        buffers_total,
        maxwritten_clean: bgw.get("maxwritten_clean"),
    })
}

/// Row estimates for user tables, keyed by bare relation name (the
/// spelling EXPLAIN uses in `Relation Name`).
pub async fn fetch_table_row_estimates(
    session: &mut Session,
) -> Result<std::collections::HashMap<String, i64>> {
    let rows = session
        .query(TABLE_ROW_ESTIMATES_SQL, &[])
        .await
        .map_err(ctx("fetch_table_row_estimates"))?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("name"), row.get("row_estimate")))
        .collect())
}

/// Most-common-value statistics for the named columns of one table,
/// used to build representative literals for plan sampling.
pub async fn fetch_column_stats(
    session: &mut Session,
    table: &str,
    columns: &[String],
) -> Result<Vec<ColumnStats>> {
    let rows = session
        .query(COLUMN_STATS_SQL, &[&table, &columns])
        .await
        .map_err(ctx("fetch_column_stats"))?;
    Ok(rows
        .into_iter()
        .map(|row| ColumnStats {
            table: row.get("table_name"),
            column: row.get("column_name"),
            most_common: row.get("most_common"),
            data_type: row.get("data_type"),
        })
        .collect())
}

/// Runs `EXPLAIN (FORMAT JSON)` for the statement, bounded by the
/// session-level `statement_timeout` the caller has set. Never uses
/// `EXPLAIN ANALYZE`.
pub async fn explain_json(session: &mut Session, sql: &str) -> Result<serde_json::Value> {
    let explain_sql = format!("EXPLAIN (FORMAT JSON) {sql}");
    let row = session
        .query_one(&explain_sql, &[])
        .await
        .map_err(ctx("explain_json"))?;
    let json: serde_json::Value = row.get(0);
    Ok(json)
}

/// ANALYZE one table. Identifiers are quoted; only the orchestrator's
/// safe-apply path calls this.
pub async fn run_analyze(session: &mut Session, schema: &str, table: &str) -> Result<()> {
    let sql = format!(
        "ANALYZE {}.{}",
        quote_ident(schema),
        quote_ident(table)
    );
    session.batch(&sql).await.map_err(ctx("run_analyze"))
}

/// Minimal identifier quoting for generated DDL.
pub fn quote_ident(ident: &str) -> String {
    if ident
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.is_empty()
    {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}
