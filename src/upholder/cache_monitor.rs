//! Cache monitor: samples buffer-hit counters, keeps a rolling window,
//! and raises threshold alerts with per-kind cooldown.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::config::CacheMonitorSection;
use crate::db::error::Result;
use crate::db::models::CacheCounters;
use crate::db::queries;
use crate::history::{window_stats, RingBuffer, WindowStats};
use crate::pool::Session;
use crate::upholder::report::{Alert, CacheAlertKind, CacheSample};

/// Buffer-cache occupancy above this percentage raises the pressure
/// alert.
const BUFFER_PRESSURE_PCT: f64 = 95.0;

pub struct CacheMonitor {
    config: CacheMonitorSection,
    cooldown: ChronoDuration,
    history: RingBuffer<CacheSample>,
    prev: Option<CacheCounters>,
    last_alert: HashMap<CacheAlertKind, DateTime<Utc>>,
}

/// Window aggregates for the report summary.
#[derive(Debug, Clone, Copy)]
pub struct CacheWindowSummary {
    pub heap: WindowStats,
    pub index: WindowStats,
}

impl CacheMonitor {
    pub fn new(config: CacheMonitorSection, cooldown_min: i64) -> Self {
        Self {
            history: RingBuffer::new(config.history_len),
            config,
            cooldown: ChronoDuration::minutes(cooldown_min),
            prev: None,
            last_alert: HashMap::new(),
        }
    }

    /// Takes one sample from the database and evaluates thresholds.
    pub async fn sample(
        &mut self,
        session: &mut Session,
        has_buffercache: bool,
    ) -> Result<(CacheSample, Vec<Alert>)> {
        let counters = queries::fetch_cache_counters(session, has_buffercache).await?;
        Ok(self.ingest(counters, Utc::now()))
    }

    /// Turns raw counters into a sample using deltas against the
    /// previous reading (absolute totals on the first), records it, and
    /// returns any alerts that cleared their cooldown.
    pub fn ingest(&mut self, counters: CacheCounters, now: DateTime<Utc>) -> (CacheSample, Vec<Alert>) {
        let base = self.prev.unwrap_or_default();
        // A counter moving backwards means the server's stats were
        // reset; fall back to absolute totals for this sample.
        let reset = counters.heap_blks_hit < base.heap_blks_hit
            || counters.idx_blks_hit < base.idx_blks_hit;
        let base = if reset || self.prev.is_none() {
            CacheCounters::default()
        } else {
            base
        };

        let heap_hit_ratio = ratio(
            counters.heap_blks_hit - base.heap_blks_hit,
            counters.heap_blks_read - base.heap_blks_read,
        );
        let index_hit_ratio = ratio(
            counters.idx_blks_hit - base.idx_blks_hit,
            counters.idx_blks_read - base.idx_blks_read,
        );
        let buffers_used_pct = if counters.buffers_total > 0 {
            100.0 * counters.buffers_used as f64 / counters.buffers_total as f64
        } else {
            0.0
        };
        let bgwriter_lag = (counters.maxwritten_clean - base.maxwritten_clean).max(0);
        self.prev = Some(counters);

        let sample = CacheSample {
            timestamp: now,
            heap_hit_ratio,
            index_hit_ratio,
            buffers_used_pct,
            bgwriter_lag,
        };
        self.history.push(sample);

        let mut alerts = Vec::new();
        if heap_hit_ratio < self.config.heap_hit_min {
            self.raise(
                &mut alerts,
                CacheAlertKind::LowHeap,
                heap_hit_ratio,
                self.config.heap_hit_min,
                now,
            );
        }
        if index_hit_ratio < self.config.index_hit_min {
            self.raise(
                &mut alerts,
                CacheAlertKind::LowIndex,
                index_hit_ratio,
                self.config.index_hit_min,
                now,
            );
        }
        if buffers_used_pct > BUFFER_PRESSURE_PCT {
            self.raise(
                &mut alerts,
                CacheAlertKind::HighBufferPressure,
                buffers_used_pct,
                BUFFER_PRESSURE_PCT,
                now,
            );
        }
        (sample, alerts)
    }

    fn raise(
        &mut self,
        alerts: &mut Vec<Alert>,
        kind: CacheAlertKind,
        observed: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) {
        if let Some(last) = self.last_alert.get(&kind) {
            if now.signed_duration_since(*last) < self.cooldown {
                return;
            }
        }
        self.last_alert.insert(kind, now);
        alerts.push(Alert {
            kind,
            subject: "shared_buffers".to_string(),
            observed,
            threshold,
            recommendation: kind.recommendation().to_string(),
            emitted_at: now,
            cooldown_until: now + self.cooldown,
        });
    }

    /// Samples taken at or after `since` (a report window).
    pub fn samples_since(&self, since: DateTime<Utc>) -> Vec<CacheSample> {
        self.history
            .iter()
            .filter(|s| s.timestamp >= since)
            .copied()
            .collect()
    }

    pub fn latest(&self) -> Option<CacheSample> {
        self.history.last().copied()
    }

    pub fn window_summary(&self) -> Option<CacheWindowSummary> {
        let heap: Vec<f64> = self.history.iter().map(|s| s.heap_hit_ratio).collect();
        let index: Vec<f64> = self.history.iter().map(|s| s.index_hit_ratio).collect();
        Some(CacheWindowSummary {
            heap: window_stats(&heap)?,
            index: window_stats(&index)?,
        })
    }
}

fn ratio(hit: i64, read: i64) -> f64 {
    let hit = hit.max(0);
    let read = read.max(0);
    if hit + read == 0 {
        1.0
    } else {
        hit as f64 / (hit + read) as f64
    }
}
