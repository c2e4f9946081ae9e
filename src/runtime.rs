//! Daemon runtime: wires config, connector, pool, and upholder
//! together, then parks on the shutdown signal.

use color_eyre::eyre::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::cli::Cli;
use crate::config::UpkeepConfig;
use crate::connection::{Connector, SslMode};
use crate::pool::Pool;
use crate::upholder::sink::{JsonlSink, LogSink, Sink, WebhookSink};
use crate::upholder::Upholder;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the daemon (or a single audit with `--once`).
pub async fn run(cli: Cli) -> Result<()> {
    let pg_config = cli.pg_config().context(
        "invalid connection config\n\nTry: pg_upkeep -H localhost -p 5432 -d mydb -U postgres -W mypassword\nSee: pg_upkeep --help",
    )?;

    let mut config = UpkeepConfig::load(cli.config_path.as_deref())?;
    if cli.apply {
        config.orchestrator.dry_run = false;
    }

    let cert_config = cli.cert_config();
    let connector = if cli.ssl || cli.ssl_insecure {
        let mode = if cli.ssl_insecure {
            SslMode::Insecure
        } else {
            SslMode::Verified
        };
        Connector::with_tls(pg_config, mode, &cert_config)?
    } else {
        let info = cli.connection_info();
        Connector::detect(pg_config, &cert_config)
            .await
            .with_context(|| {
                format!(
                    "could not connect to PostgreSQL\n\nConnection: {}:{}/{}\nTried: No TLS, SSL (verified), SSL (insecure)\nSee: pg_upkeep --help",
                    info.host, info.port, info.dbname
                )
            })?
    };

    let info = cli.connection_info();
    info!(
        host = %info.host,
        port = info.port,
        dbname = %info.dbname,
        ssl = connector.ssl_mode().label(),
        "connecting"
    );

    let pool = Pool::connect(connector, config.pool_config()).await?;
    let upholder = Upholder::new(pool.clone(), config);

    upholder.register_alert_sink(Arc::new(LogSink));
    upholder.register_report_sink(Arc::new(LogSink));
    if let Some(ref path) = cli.report_file {
        let sink = Arc::new(JsonlSink::create(path)?);
        upholder.register_alert_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        upholder.register_report_sink(sink as Arc<dyn Sink>);
    }
    if let Some(ref url) = cli.webhook_url {
        let sink = Arc::new(WebhookSink::new(url.clone()));
        upholder.register_alert_sink(Arc::clone(&sink) as Arc<dyn Sink>);
        upholder.register_report_sink(sink as Arc<dyn Sink>);
    }

    upholder.start().await?;

    if cli.once {
        let report = upholder.trigger_audit().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        upholder.stop(STOP_TIMEOUT).await;
        pool.close_all();
        return Ok(());
    }

    shutdown_signal().await?;
    upholder.stop(STOP_TIMEOUT).await;
    pool.close_all();
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Ctrl+C on non-Unix platforms).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("received Ctrl+C");
    }

    Ok(())
}
