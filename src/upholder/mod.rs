//! The upholder orchestrator: owns the background workers, composes
//! their findings into reports, and gates the small set of safe
//! auto-applied fixes.

pub mod cache_monitor;
pub mod index_auditor;
pub mod plan;
pub mod query_analyzer;
pub mod report;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::UpkeepConfig;
use crate::db::error::DbError;
use crate::db::models::ServerInfo;
use crate::db::queries;
use crate::pool::Pool;
use crate::scheduler::{Scheduler, Shutdown, ShutdownHandle, TaskSpec, WorkerStatus};

use cache_monitor::CacheMonitor;
use index_auditor::{IndexAudit, IndexAuditor};
use query_analyzer::{QueryAnalysis, QueryAnalyzer};
use report::{IndexFinding, IndexFindingKind, Report};
use sink::{Sink, SinkRegistry};

/// Consecutive failed cycles before the orchestrator is degraded.
const DEGRADED_AFTER: u32 = 3;

#[derive(Error, Debug)]
pub enum UpholderError {
    #[error("invalid state: cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: UpholderState,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpholderState {
    New,
    Started,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleInfo {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
}

#[derive(Serialize)]
pub struct UpholderStatus {
    pub state: UpholderState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleInfo>,
    pub last_report_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub pool: crate::pool::PoolStats,
    pub workers: Vec<WorkerStatus>,
}

struct Inner {
    pool: Pool,
    config: UpkeepConfig,
    state: Mutex<UpholderState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
    last_cycle: Mutex<Option<CycleInfo>>,
    last_report: Mutex<Option<Report>>,
    /// Single-flight gate for audit-cycle assembly.
    cycle_gate: tokio::sync::Mutex<()>,
    analyzer: tokio::sync::Mutex<QueryAnalyzer>,
    auditor: tokio::sync::Mutex<IndexAuditor>,
    cache: tokio::sync::Mutex<CacheMonitor>,
    /// Previous index pass, carried into reports between index cadences.
    index_carry: Mutex<CarriedIndexPass>,
    alert_sinks: SinkRegistry,
    report_sinks: SinkRegistry,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    shutdown: Mutex<Option<(ShutdownHandle, Shutdown)>>,
    has_buffercache: AtomicBool,
    /// Components that hit a permission error; skipped until restart.
    disabled_components: Mutex<std::collections::HashSet<&'static str>>,
}

#[derive(Default)]
struct CarriedIndexPass {
    findings: Vec<IndexFinding>,
    last_run: Option<tokio::time::Instant>,
}

#[derive(Clone)]
pub struct Upholder {
    inner: Arc<Inner>,
}

impl Upholder {
    pub fn new(pool: Pool, config: UpkeepConfig) -> Self {
        let sink_timeout = Duration::from_millis(config.orchestrator.sink_timeout_ms);
        let disable_after = config.orchestrator.sink_disable_after;
        Self {
            inner: Arc::new(Inner {
                pool,
                analyzer: tokio::sync::Mutex::new(QueryAnalyzer::new(
                    config.query_analyzer.clone(),
                )),
                auditor: tokio::sync::Mutex::new(IndexAuditor::new(config.index_auditor.clone())),
                cache: tokio::sync::Mutex::new(CacheMonitor::new(
                    config.cache_monitor.clone(),
                    config.orchestrator.alert_cooldown_min,
                )),
                alert_sinks: SinkRegistry::new(sink_timeout, disable_after),
                report_sinks: SinkRegistry::new(sink_timeout, disable_after),
                config,
                state: Mutex::new(UpholderState::New),
                started_at: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
                last_cycle: Mutex::new(None),
                last_report: Mutex::new(None),
                cycle_gate: tokio::sync::Mutex::new(()),
                index_carry: Mutex::new(CarriedIndexPass::default()),
                scheduler: Mutex::new(None),
                shutdown: Mutex::new(None),
                has_buffercache: AtomicBool::new(false),
                disabled_components: Mutex::new(std::collections::HashSet::new()),
            }),
        }
    }

    pub fn register_alert_sink(&self, sink: Arc<dyn Sink>) {
        self.inner.alert_sinks.register(sink);
    }

    pub fn register_report_sink(&self, sink: Arc<dyn Sink>) {
        self.inner.report_sinks.register(sink);
    }

    pub fn state(&self) -> UpholderState {
        *lock(&self.inner.state)
    }

    /// Starts the background workers. Valid from `New` or `Stopped`.
    pub async fn start(&self) -> Result<(), UpholderError> {
        {
            let state = lock(&self.inner.state);
            if !matches!(*state, UpholderState::New | UpholderState::Stopped) {
                return Err(UpholderError::InvalidState {
                    action: "start",
                    state: *state,
                });
            }
        }

        let server = self.fetch_server_info().await?;
        info!(
            version = %server.version,
            pg_stat_statements = server.extensions.pg_stat_statements,
            "connected, starting upholder"
        );
        self.inner
            .has_buffercache
            .store(server.extensions.pg_buffercache, Ordering::Relaxed);

        let (handle, shutdown) = Shutdown::new();
        let scheduler = Arc::new(Scheduler::new(shutdown.clone()));

        let config = &self.inner.config;
        let this = self.clone();
        scheduler.schedule(TaskSpec {
            name: "cache_monitor",
            interval: Duration::from_secs(config.cache_monitor.interval_s),
            jitter_frac: 0.2,
            task: Arc::new(move |shutdown| {
                let this = this.clone();
                Box::pin(async move { this.cache_tick(shutdown).await })
            }),
        });
        let this = self.clone();
        scheduler.schedule(TaskSpec {
            name: "audit_cycle",
            interval: Duration::from_secs(config.query_analyzer.interval_min * 60),
            jitter_frac: 0.1,
            task: Arc::new(move |shutdown| {
                let this = this.clone();
                Box::pin(async move {
                    this.run_cycle(shutdown).await?;
                    Ok(())
                })
            }),
        });
        let this = self.clone();
        scheduler.schedule(TaskSpec {
            name: "pool_sweep",
            interval: Duration::from_secs(config.pool.health_sweep_interval_s),
            jitter_frac: 0.2,
            task: Arc::new(move |_shutdown| {
                let this = this.clone();
                Box::pin(async move {
                    this.inner.pool.sweep().await;
                    Ok(())
                })
            }),
        });

        lock(&self.inner.disabled_components).clear();
        *lock(&self.inner.state) = UpholderState::Started;
        scheduler.start();
        *lock(&self.inner.scheduler) = Some(scheduler);
        *lock(&self.inner.shutdown) = Some((handle, shutdown));
        *lock(&self.inner.started_at) = Some(Utc::now());
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        *lock(&self.inner.state) = UpholderState::Running;
        Ok(())
    }

    /// Requests cancellation and waits up to `timeout` for workers to
    /// wind down. The pool stays open; callers own its lifecycle.
    pub async fn stop(&self, timeout: Duration) {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, UpholderState::New | UpholderState::Stopped) {
                return;
            }
            *state = UpholderState::Stopping;
        }
        if let Some((handle, _)) = lock(&self.inner.shutdown).as_ref() {
            handle.cancel();
        }
        let scheduler = lock(&self.inner.scheduler).clone();
        if let Some(scheduler) = scheduler {
            scheduler.stop(timeout).await;
        }
        *lock(&self.inner.shutdown) = None;
        *lock(&self.inner.state) = UpholderState::Stopped;
        info!("upholder stopped");
    }

    /// Forces an audit cycle and returns its report, even when partial.
    /// If a cycle is already in flight the trigger coalesces with it
    /// and that cycle's report is returned instead.
    pub async fn trigger_audit(&self) -> Result<Report, UpholderError> {
        {
            let state = lock(&self.inner.state);
            if matches!(*state, UpholderState::New | UpholderState::Stopped) {
                return Err(UpholderError::InvalidState {
                    action: "trigger_audit",
                    state: *state,
                });
            }
        }
        let shutdown = lock(&self.inner.shutdown)
            .as_ref()
            .map(|(_, s)| s.clone())
            .ok_or(UpholderError::InvalidState {
                action: "trigger_audit",
                state: UpholderState::Stopped,
            })?;

        if self.inner.cycle_gate.try_lock().is_err() {
            // Coalesce: wait for the in-flight cycle, hand back its report.
            let _wait = self.inner.cycle_gate.lock().await;
            drop(_wait);
            if let Some(report) = lock(&self.inner.last_report).clone() {
                return Ok(report);
            }
        }
        self.run_cycle(shutdown).await.map_err(|e| match e.downcast::<DbError>() {
            Ok(db) => UpholderError::Db(db),
            Err(e) => UpholderError::Db(DbError::Invariant {
                context: e.to_string(),
            }),
        })
    }

    pub fn status(&self) -> UpholderStatus {
        let workers = lock(&self.inner.scheduler)
            .as_ref()
            .map(|s| s.worker_status())
            .unwrap_or_default();
        UpholderStatus {
            state: *lock(&self.inner.state),
            started_at: *lock(&self.inner.started_at),
            last_cycle: *lock(&self.inner.last_cycle),
            last_report_at: lock(&self.inner.last_report)
                .as_ref()
                .map(|r| r.finished_at),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Relaxed),
            pool: self.inner.pool.stats(),
            workers,
        }
    }

    pub fn last_report(&self) -> Option<Report> {
        lock(&self.inner.last_report).clone()
    }

    async fn fetch_server_info(&self) -> Result<ServerInfo, DbError> {
        let mut session = self
            .inner
            .pool
            .acquire(self.inner.config.acquire_timeout())
            .await?;
        queries::fetch_server_info(&mut session).await
    }

    /// Cache-monitor worker body: one sample, alerts out immediately.
    async fn cache_tick(&self, _shutdown: Shutdown) -> color_eyre::Result<()> {
        if !self.component_enabled("cache_monitor") {
            return Ok(());
        }
        let mut session = self
            .inner
            .pool
            .acquire(self.inner.config.acquire_timeout())
            .await?;
        let has_buffercache = self.inner.has_buffercache.load(Ordering::Relaxed);
        let alerts = {
            let mut cache = self.inner.cache.lock().await;
            let (_, alerts) = cache.sample(&mut session, has_buffercache).await?;
            alerts
        };
        drop(session);
        for alert in &alerts {
            self.inner.alert_sinks.deliver_alert(alert).await;
        }
        Ok(())
    }

    /// One audit cycle: C6 sample, C4 pass, C5 pass when due, report
    /// assembly and delivery. Component failures are recorded in the
    /// report; only an unreachable database fails the cycle.
    async fn run_cycle(&self, shutdown: Shutdown) -> color_eyre::Result<Report> {
        let _gate = self.inner.cycle_gate.lock().await;
        let started_at = Utc::now();
        let mut failed_components: Vec<String> = Vec::new();
        let mut pending_alerts = Vec::new();

        // Fresh cache sample on its own session so the report window
        // always holds at least one in-window sample.
        let has_buffercache = self.inner.has_buffercache.load(Ordering::Relaxed);
        match self.inner.pool.acquire(self.inner.config.acquire_timeout()).await {
            Ok(mut session) => {
                if self.component_enabled("cache_monitor") {
                    let mut cache = self.inner.cache.lock().await;
                    if let Err(e) = cache.sample(&mut session, has_buffercache).await.map(
                        |(_, alerts)| {
                            pending_alerts.extend(alerts);
                        },
                    ) {
                        self.note_component_failure("cache_monitor", &e, &mut failed_components);
                    }
                }
            }
            Err(e) => return self.fail_cycle(started_at, e).await,
        }

        // One session for the catalog-consistent analyzer + auditor reads.
        let mut analysis = QueryAnalysis::default();
        let mut audit_ran = false;
        match self.inner.pool.acquire(self.inner.config.acquire_timeout()).await {
            Ok(mut session) => {
                if !shutdown.is_cancelled() && self.component_enabled("query_analyzer") {
                    let mut analyzer = self.inner.analyzer.lock().await;
                    match analyzer.run_pass(&mut session, &shutdown).await {
                        Ok(result) => analysis = result,
                        Err(e) => {
                            self.note_component_failure("query_analyzer", &e, &mut failed_components);
                        }
                    }
                }

                if !shutdown.is_cancelled()
                    && self.component_enabled("index_auditor")
                    && self.index_pass_due()
                {
                    let mut auditor = self.inner.auditor.lock().await;
                    match auditor
                        .run_pass(&mut session, &analysis.seq_scans, &shutdown)
                        .await
                    {
                        Ok(audit) => {
                            audit_ran = true;
                            self.apply_safe_actions(&mut session, &audit).await;
                            let mut carry = lock(&self.inner.index_carry);
                            carry.findings = audit.findings;
                            carry.last_run = Some(tokio::time::Instant::now());
                        }
                        Err(e) => {
                            self.note_component_failure("index_auditor", &e, &mut failed_components);
                        }
                    }
                }
            }
            Err(e) => return self.fail_cycle(started_at, e).await,
        }
        if !audit_ran && shutdown.is_cancelled() {
            failed_components.push("index_auditor".to_string());
        }

        // Alerts for this cycle go out before the report.
        for alert in &pending_alerts {
            self.inner.alert_sinks.deliver_alert(alert).await;
        }

        let cache_samples = {
            let cache = self.inner.cache.lock().await;
            cache.samples_since(started_at)
        };
        let indexes = lock(&self.inner.index_carry).findings.clone();
        let mut report = Report {
            started_at,
            finished_at: Utc::now(),
            queries: analysis.issues,
            indexes,
            cache: cache_samples,
            pool: self.inner.pool.stats(),
            summary: String::new(),
            cancelled: shutdown.is_cancelled(),
            partial: !failed_components.is_empty(),
            failed_components,
        };
        report.build_summary();

        self.inner.report_sinks.deliver_report(&report).await;
        *lock(&self.inner.last_report) = Some(report.clone());
        *lock(&self.inner.last_cycle) = Some(CycleInfo {
            started_at,
            finished_at: report.finished_at,
            ok: true,
        });
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        {
            let mut state = lock(&self.inner.state);
            if *state == UpholderState::Degraded {
                info!("audit cycle succeeded, leaving degraded state");
                *state = UpholderState::Running;
            }
        }
        debug!(summary = %report.summary, "audit cycle complete");
        Ok(report)
    }

    /// Database-unreachable path: the whole cycle is marked failed and
    /// the degraded counter advances.
    async fn fail_cycle(
        &self,
        started_at: DateTime<Utc>,
        e: DbError,
    ) -> color_eyre::Result<Report> {
        *lock(&self.inner.last_cycle) = Some(CycleInfo {
            started_at,
            finished_at: Utc::now(),
            ok: false,
        });
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= DEGRADED_AFTER {
            let mut state = lock(&self.inner.state);
            if *state == UpholderState::Running {
                warn!(failures, "three audit cycles failed in a row, entering degraded state");
                *state = UpholderState::Degraded;
            }
        }
        Err(color_eyre::eyre::Report::new(e))
    }

    fn component_enabled(&self, component: &'static str) -> bool {
        !lock(&self.inner.disabled_components).contains(component)
    }

    fn note_component_failure(
        &self,
        component: &'static str,
        e: &DbError,
        failed: &mut Vec<String>,
    ) {
        let permission = match e {
            DbError::Postgres(pg) | DbError::Query { source: pg, .. } => {
                crate::db::error::is_permission_denied(pg)
            }
            DbError::PermissionDenied { .. } => true,
            _ => false,
        };
        match e {
            DbError::Cancelled => {}
            _ if permission => {
                // Logged once: further cycles skip the component.
                if lock(&self.inner.disabled_components).insert(component) {
                    error!(
                        component,
                        "permission denied reading catalog views; component disabled until restart"
                    );
                }
            }
            _ => error!(component, error = %e, "component failed during audit cycle"),
        }
        failed.push(component.to_string());
    }

    fn index_pass_due(&self) -> bool {
        let carry = lock(&self.inner.index_carry);
        match carry.last_run {
            None => true,
            Some(last) => {
                last.elapsed()
                    >= Duration::from_secs(self.inner.config.index_auditor.interval_min * 60)
            }
        }
    }

    /// The closed set of autonomous actions: ANALYZE for stale
    /// statistics and creation of findings explicitly marked safe.
    /// Everything else is advisory in every mode.
    async fn apply_safe_actions(&self, session: &mut crate::pool::Session, audit: &IndexAudit) {
        let orchestrator = &self.inner.config.orchestrator;
        if orchestrator.dry_run || !orchestrator.auto_apply_safe {
            return;
        }
        for (schema, table) in &audit.stale_tables {
            match queries::run_analyze(session, schema, table).await {
                Ok(()) => {
                    info!(schema = %schema, table = %table, "ran ANALYZE on table with stale statistics");
                }
                Err(e) => warn!(schema = %schema, table = %table, error = %e, "ANALYZE failed"),
            }
        }
        for finding in &audit.findings {
            if !(finding.safe && finding.kind == IndexFindingKind::Missing) {
                continue;
            }
            match session
                .exec(&finding.recommendation, &[], crate::pool::ExecOptions::default())
                .await
            {
                Ok(_) => info!(
                    table = %finding.table,
                    ddl = %finding.recommendation,
                    "created index from safe finding"
                ),
                Err(e) => warn!(
                    table = %finding.table,
                    ddl = %finding.recommendation,
                    error = %e,
                    "safe index creation failed"
                ),
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
