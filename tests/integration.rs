//! Integration tests for pg_upkeep
//!
//! These tests need a running PostgreSQL instance (13+) reachable via
//! `PG_UPKEEP_TEST_DSN` (default: `host=localhost port=5432
//! user=postgres dbname=postgres`). `pg_stat_statements` should be in
//! `shared_preload_libraries` for the full analyzer scenarios; tests
//! that depend on it skip cleanly when it is absent.
//!
//! ```bash
//! docker run -d --name pg_upkeep_test -e POSTGRES_HOST_AUTH_METHOD=trust \
//!   -p 5432:5432 postgres:16 \
//!   -c shared_preload_libraries=pg_stat_statements
//!
//! cargo test --features integration --test integration
//! ```

#![cfg(feature = "integration")]

use std::sync::Arc;
use std::time::Duration;

use pg_upkeep::bulk::{BulkJob, BulkLoader, BulkMethod, OnConflict, SqlValue};
use pg_upkeep::config::UpkeepConfig;
use pg_upkeep::connection::Connector;
use pg_upkeep::db::error::DbError;
use pg_upkeep::pool::{Pool, PoolConfig};
use pg_upkeep::upholder::report::{IndexFindingKind, QueryIssueKind};
use pg_upkeep::upholder::{Upholder, UpholderState};
use serial_test::serial;
use tokio::time::Instant;

fn test_connector() -> Connector {
    let dsn = std::env::var("PG_UPKEEP_TEST_DSN")
        .unwrap_or_else(|_| "host=localhost port=5432 user=postgres dbname=postgres".to_string());
    let pg: tokio_postgres::Config = dsn.parse().expect("invalid PG_UPKEEP_TEST_DSN");
    Connector::plain(pg)
}

async fn test_pool(min_conn: usize, max_conn: usize) -> Option<Pool> {
    let pool = Pool::connect(
        test_connector(),
        PoolConfig {
            min_conn,
            max_conn,
            acquire_timeout: Duration::from_secs(5),
            max_idle_age: Duration::from_secs(300),
            cache_cap_per_session: 128,
        },
    )
    .await
    .ok()?;
    // A warmup failure leaves the pool empty; probe once so tests can
    // skip when no server is listening.
    match pool.acquire(Duration::from_secs(2)).await {
        Ok(_session) => Some(pool),
        Err(_) => {
            eprintln!("skipping: PostgreSQL not reachable");
            None
        }
    }
}

async fn exec(pool: &Pool, sql: &str) {
    let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
    session.batch(sql).await.unwrap();
}

async fn has_pg_stat_statements(pool: &Pool) -> bool {
    let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
    let _ = session
        .batch("CREATE EXTENSION IF NOT EXISTS pg_stat_statements")
        .await;
    session
        .query_opt(
            "SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements'",
            &[],
        )
        .await
        .unwrap()
        .is_some()
}

// ============================================================================
// S1 - Pool fairness under contention
// ============================================================================

#[tokio::test]
#[serial]
async fn pool_fairness_under_contention() {
    let Some(pool) = test_pool(0, 2).await else {
        return;
    };

    let first = pool.acquire(Duration::from_secs(5)).await.unwrap();
    let second = pool.acquire(Duration::from_secs(5)).await.unwrap();
    assert_eq!(pool.stats().in_use, 2);

    // Five more acquirers queue behind the held sessions, spawned in
    // order so the semaphore queue order is deterministic.
    let started = Instant::now();
    let mut waiters = Vec::new();
    for i in 0..5u32 {
        let pool = pool.clone();
        waiters.push(tokio::spawn(async move {
            let outcome = pool.acquire(Duration::from_millis(1000)).await;
            (i, outcome.map(|s| (s, Instant::now())))
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(second);

    let mut succeeded = Vec::new();
    let mut exhausted = 0;
    for waiter in waiters {
        let (i, outcome) = waiter.await.unwrap();
        match outcome {
            Ok((session, at)) => {
                succeeded.push((i, at));
                drop(session);
            }
            Err(DbError::PoolExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    // FIFO: the first two spawned waiters are the two that succeed.
    succeeded.sort_by_key(|(i, _)| *i);
    assert_eq!(
        succeeded.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(exhausted, 3);
    // Releases arrived ~200ms and ~400ms after the waiters queued.
    for (_, at) in &succeeded {
        assert!(at.duration_since(started) < Duration::from_millis(900));
    }

    let stats = pool.stats();
    assert!(stats.total_created <= 2, "created {}", stats.total_created);
    assert_eq!(stats.acquire_timeouts, 3);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
#[serial]
async fn zero_timeout_acquire_fails_immediately_when_busy() {
    let Some(pool) = test_pool(0, 1).await else {
        return;
    };
    let held = pool.acquire(Duration::from_secs(5)).await.unwrap();
    let err = pool.acquire(Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { .. }));
    drop(held);

    // With an idle session available, a zero timeout succeeds.
    let ok = pool.acquire(Duration::ZERO).await;
    assert!(ok.is_ok());
}

// ============================================================================
// S2/S3 - Audit cycle: seq-scan detection and index findings
// ============================================================================

fn audit_config() -> UpkeepConfig {
    let mut config = UpkeepConfig::default();
    config.query_analyzer.slow_mean_ms = 0.0; // everything counts as slow
    config.query_analyzer.min_calls = 5;
    config.query_analyzer.explain_sample_rate = 1.0;
    config.query_analyzer.seq_scan_threshold_rows = 10_000;
    config.index_auditor.min_table_bytes = 0;
    config.index_auditor.min_rows = 10_000;
    config.index_auditor.min_age_days = 0;
    config.cache_monitor.interval_s = 1;
    config
}

#[tokio::test]
#[serial]
async fn audit_detects_seq_scans_and_index_findings() {
    let Some(pool) = test_pool(1, 8).await else {
        return;
    };
    if !has_pg_stat_statements(&pool).await {
        eprintln!("skipping: pg_stat_statements not available");
        return;
    }

    exec(&pool, "DROP TABLE IF EXISTS upkeep_orders").await;
    exec(
        &pool,
        "CREATE TABLE upkeep_orders (id bigserial PRIMARY KEY, status text, legacy_col int)",
    )
    .await;
    exec(
        &pool,
        "INSERT INTO upkeep_orders (status, legacy_col)
         SELECT CASE WHEN g % 10 = 0 THEN 'open' ELSE 'closed' END, g
         FROM generate_series(1, 50000) g",
    )
    .await;
    exec(&pool, "CREATE INDEX idx_upkeep_orders_legacy ON upkeep_orders (legacy_col)").await;
    exec(&pool, "ANALYZE upkeep_orders").await;
    exec(&pool, "SELECT pg_stat_statements_reset()").await;

    // Build up a seq-scanning workload.
    {
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        for _ in 0..10 {
            let status = "open".to_string();
            session
                .query(
                    "SELECT count(*) FROM upkeep_orders WHERE status = $1",
                    &[&status],
                )
                .await
                .unwrap();
        }
    }

    // Give the stats collector a moment to flush seq_scan counters.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let upholder = Upholder::new(pool.clone(), audit_config());
    upholder.start().await.unwrap();
    let report = upholder.trigger_audit().await.unwrap();

    let seq_issues: Vec<_> = report
        .queries
        .iter()
        .filter(|q| q.kind == QueryIssueKind::SeqScanOnLargeTable)
        .collect();
    assert!(
        seq_issues.iter().any(|q| q.fingerprint.contains("upkeep_orders")),
        "expected a seq-scan issue for upkeep_orders, got {:?}",
        report.queries
    );
    assert!(report
        .queries
        .iter()
        .any(|q| q.kind == QueryIssueKind::SlowMean));

    let missing: Vec<_> = report
        .indexes
        .iter()
        .filter(|f| f.kind == IndexFindingKind::Missing && f.table == "upkeep_orders")
        .collect();
    assert_eq!(missing.len(), 1, "findings: {:?}", report.indexes);
    assert_eq!(missing[0].columns, vec!["status"]);
    assert!(missing[0].confidence >= 0.1);
    assert_eq!(
        missing[0].recommendation,
        "CREATE INDEX ON upkeep_orders (status)"
    );

    // S3: the never-scanned secondary index is flagged; the primary key
    // is not.
    let unused: Vec<_> = report
        .indexes
        .iter()
        .filter(|f| f.kind == IndexFindingKind::Unused)
        .collect();
    assert!(unused
        .iter()
        .any(|f| f.index.as_deref() == Some("idx_upkeep_orders_legacy")));
    assert!(report
        .indexes
        .iter()
        .all(|f| f.index.as_deref() != Some("upkeep_orders_pkey")));

    // Dry-run: the advisory index was not actually created.
    {
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let row = session
            .query_one(
                "SELECT count(*)::bigint AS n FROM pg_indexes
                 WHERE tablename = 'upkeep_orders' AND indexdef LIKE '%(status)%'",
                &[],
            )
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 0);
    }

    // Cache samples taken during the cycle fall inside its window.
    for sample in &report.cache {
        assert!(sample.timestamp >= report.started_at);
        assert!(sample.timestamp <= report.finished_at);
    }

    upholder.stop(Duration::from_secs(5)).await;
    exec(&pool, "DROP TABLE upkeep_orders").await;
    pool.close_all();
}

// ============================================================================
// S5 - Bulk method selection
// ============================================================================

fn bulk_rows(n: usize) -> Vec<Vec<SqlValue>> {
    (0..n)
        .map(|i| {
            vec![
                SqlValue::I64(i as i64),
                SqlValue::Text(format!("name-{i}")),
            ]
        })
        .collect()
}

fn bulk_job(n: usize, on_conflict: OnConflict) -> BulkJob {
    BulkJob {
        table: "upkeep_bulk".into(),
        columns: vec!["id".into(), "name".into()],
        rows: bulk_rows(n),
        on_conflict,
    }
}

#[tokio::test]
#[serial]
async fn bulk_loader_selects_methods_by_size() {
    let Some(pool) = test_pool(1, 4).await else {
        return;
    };
    exec(&pool, "DROP TABLE IF EXISTS upkeep_bulk").await;
    exec(
        &pool,
        "CREATE TABLE upkeep_bulk (id bigint PRIMARY KEY, name text)",
    )
    .await;

    let loader = BulkLoader::new(pool.clone(), UpkeepConfig::default().bulk);

    let result = loader.load(bulk_job(20, OnConflict::Error)).await.unwrap();
    assert_eq!(result.method_used, BulkMethod::SingleInsert);
    assert_eq!(result.rows_loaded, 20);
    assert_eq!(result.conflicts_skipped, 0);
    exec(&pool, "TRUNCATE upkeep_bulk").await;

    let result = loader.load(bulk_job(500, OnConflict::Error)).await.unwrap();
    assert_eq!(result.method_used, BulkMethod::MultiValues);
    assert_eq!(result.rows_loaded, 500);
    exec(&pool, "TRUNCATE upkeep_bulk").await;

    let result = loader.load(bulk_job(5000, OnConflict::Error)).await.unwrap();
    assert_eq!(result.method_used, BulkMethod::PreparedBatch);
    assert_eq!(result.rows_loaded, 5000);
    exec(&pool, "TRUNCATE upkeep_bulk").await;

    let result = loader
        .load(bulk_job(50_000, OnConflict::Error))
        .await
        .unwrap();
    assert_eq!(result.method_used, BulkMethod::CopyFrom);
    assert_eq!(result.rows_loaded, 50_000);
    assert!(result.bytes > 0);

    exec(&pool, "DROP TABLE upkeep_bulk").await;
    pool.close_all();
}

#[tokio::test]
#[serial]
async fn bulk_conflicts_are_skipped_with_ignore_policy() {
    let Some(pool) = test_pool(1, 4).await else {
        return;
    };
    exec(&pool, "DROP TABLE IF EXISTS upkeep_bulk").await;
    exec(
        &pool,
        "CREATE TABLE upkeep_bulk (id bigint PRIMARY KEY, name text)",
    )
    .await;

    let loader = BulkLoader::new(pool.clone(), UpkeepConfig::default().bulk);
    loader.load(bulk_job(100, OnConflict::Error)).await.unwrap();

    // Same ids again: every row conflicts.
    let result = loader.load(bulk_job(100, OnConflict::Ignore)).await.unwrap();
    assert_eq!(result.rows_loaded, 0);
    assert_eq!(result.conflicts_skipped, 100);

    // COPY path with conflicts routes through the staging table.
    let result = loader
        .load(bulk_job(20_000, OnConflict::Ignore))
        .await
        .unwrap();
    assert_eq!(result.method_used, BulkMethod::CopyFrom);
    assert_eq!(result.rows_loaded, 20_000 - 100);
    assert_eq!(result.conflicts_skipped, 100);

    // Upserts replace instead of skipping.
    let mut job = bulk_job(100, OnConflict::UpdateAll {
        conflict_target: vec!["id".into()],
    });
    job.rows = (0..100)
        .map(|i| vec![SqlValue::I64(i as i64), SqlValue::Text("updated".into())])
        .collect();
    let result = loader.load(job).await.unwrap();
    assert_eq!(result.rows_loaded, 100);

    {
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let row = session
            .query_one(
                "SELECT count(*)::bigint AS n FROM upkeep_bulk WHERE name = 'updated'",
                &[],
            )
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 100);
    }

    exec(&pool, "DROP TABLE upkeep_bulk").await;
    pool.close_all();
}

#[tokio::test]
#[serial]
async fn bulk_bad_input_fails_fast() {
    let Some(pool) = test_pool(0, 2).await else {
        return;
    };
    let loader = BulkLoader::new(pool.clone(), UpkeepConfig::default().bulk);
    let job = BulkJob {
        table: "upkeep_bulk".into(),
        columns: vec!["id".into(), "name".into()],
        rows: vec![vec![SqlValue::I64(1)]],
        on_conflict: OnConflict::Error,
    };
    let err = loader.load(job).await.unwrap_err();
    assert!(matches!(err, DbError::BadInput { .. }));
    pool.close_all();
}

// ============================================================================
// S6 - Cycle cancellation
// ============================================================================

#[tokio::test]
#[serial]
async fn stop_mid_cycle_reaches_stopped_without_leaking_sessions() {
    let Some(pool) = test_pool(1, 8).await else {
        return;
    };

    let upholder = Upholder::new(pool.clone(), audit_config());
    upholder.start().await.unwrap();
    assert_eq!(upholder.state(), UpholderState::Running);

    let trigger = {
        let upholder = upholder.clone();
        tokio::spawn(async move { upholder.trigger_audit().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    upholder.stop(Duration::from_secs(2)).await;
    assert_eq!(upholder.state(), UpholderState::Stopped);

    // The in-flight trigger resolves (possibly with a partial report).
    let _ = trigger.await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.stats().in_use, 0, "sessions leaked");
    pool.close_all();
}

// ============================================================================
// Statement cache round-trip on a live session
// ============================================================================

#[tokio::test]
#[serial]
async fn prepared_statements_are_reused_per_session() {
    let Some(pool) = test_pool(0, 1).await else {
        return;
    };
    let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
    let n = 5i64;
    for _ in 0..3 {
        let rows = session
            .query("SELECT $1::bigint AS v", &[&n])
            .await
            .unwrap();
        let v: i64 = rows[0].get("v");
        assert_eq!(v, 5);
    }
    drop(session);
    pool.close_all();
}
