//! Alert/report receivers. Delivery is best-effort and bounded: a slow
//! or failing sink can never stall the audit cycle, and a sink that
//! keeps failing is disabled until it is registered again.

use async_trait::async_trait;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::upholder::report::{Alert, Report};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("HTTP delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// A receiver of alerts and reports. Implementations must buffer
/// internally if their work can exceed the delivery timeout.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn on_alert(&self, alert: &Alert) -> Result<(), SinkError>;

    async fn on_report(&self, report: &Report) -> Result<(), SinkError>;
}

struct Registered {
    sink: Arc<dyn Sink>,
    consecutive_failures: AtomicU32,
    disabled: AtomicBool,
}

/// One registry per event kind; the orchestrator owns two.
pub struct SinkRegistry {
    sinks: Mutex<Vec<Arc<Registered>>>,
    timeout: Duration,
    disable_after: u32,
}

impl SinkRegistry {
    pub fn new(timeout: Duration, disable_after: u32) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            timeout,
            disable_after: disable_after.max(1),
        }
    }

    /// Registers a sink. Re-registering a name re-enables it and resets
    /// its failure count.
    pub fn register(&self, sink: Arc<dyn Sink>) {
        let mut sinks = lock(&self.sinks);
        sinks.retain(|r| r.sink.name() != sink.name());
        sinks.push(Arc::new(Registered {
            sink,
            consecutive_failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        }));
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sinks).is_empty()
    }

    pub async fn deliver_alert(&self, alert: &Alert) {
        let sinks = lock(&self.sinks).clone();
        for entry in sinks {
            self.deliver(&entry, entry.sink.on_alert(alert)).await;
        }
    }

    pub async fn deliver_report(&self, report: &Report) {
        let sinks = lock(&self.sinks).clone();
        for entry in sinks {
            self.deliver(&entry, entry.sink.on_report(report)).await;
        }
    }

    async fn deliver<F>(&self, entry: &Registered, fut: F)
    where
        F: std::future::Future<Output = Result<(), SinkError>>,
    {
        if entry.disabled.load(Ordering::Acquire) {
            return;
        }
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        };
        match outcome {
            Ok(()) => entry.consecutive_failures.store(0, Ordering::Release),
            Err(reason) => {
                let failures = entry.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(sink = entry.sink.name(), failures, reason, "sink delivery failed");
                if failures >= self.disable_after {
                    entry.disabled.store(true, Ordering::Release);
                    warn!(
                        sink = entry.sink.name(),
                        "sink disabled until re-registered"
                    );
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Emits alerts and report summaries as tracing events.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        warn!(
            kind = ?alert.kind,
            subject = %alert.subject,
            observed = alert.observed,
            threshold = alert.threshold,
            "{}",
            alert.recommendation
        );
        Ok(())
    }

    async fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        info!(
            queries = report.queries.len(),
            indexes = report.indexes.len(),
            cancelled = report.cancelled,
            partial = report.partial,
            "{}",
            report.summary
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonlLine<'a> {
    Alert { data: &'a Alert },
    Report { data: &'a Report },
}

/// Appends one JSON object per event to a file.
pub struct JsonlSink {
    name: String,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            name: format!("jsonl:{}", path.display()),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, line: &JsonlLine<'_>) -> Result<(), SinkError> {
        let mut writer = lock(&self.writer);
        serde_json::to_writer(&mut *writer, line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.write_line(&JsonlLine::Alert { data: alert })
    }

    async fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        self.write_line(&JsonlLine::Report { data: report })
    }
}

/// POSTs events as JSON to an HTTP endpoint.
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: format!("webhook:{url}"),
            url,
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize>(&self, body: &T) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.post(alert).await
    }

    async fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        self.post(report).await
    }
}
