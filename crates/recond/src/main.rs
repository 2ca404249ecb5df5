//! recond — streaming reconstruction daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use recon_core::config::ReconConfig;
use recon_pipeline::{Pipeline, StageRegistry, WriterRegistry};

mod listener;
mod session;

use listener::{new_session_table, ConnectionListener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ReconConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ReconConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ReconConfig::default()
    });

    // Reject a bad stage list before accepting anyone.
    let registry = Arc::new(StageRegistry::with_builtin());
    let probe = Pipeline::build(
        &config.pipeline,
        &registry,
        WriterRegistry::with_image_writers(),
    )
    .context("invalid pipeline configuration")?;
    tracing::info!(
        stages = ?probe.stage_names(),
        queue_capacity = config.pipeline.queue_capacity,
        "pipeline configured"
    );
    drop(probe);

    let addr = format!("{}:{}", config.network.listen_addr, config.network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "recond listening");

    let sessions = new_session_table();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener_task = tokio::spawn(
        ConnectionListener::new(
            listener,
            Arc::new(config.pipeline.clone()),
            registry,
            config.network.max_readout_bytes,
            sessions.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let session_printer = {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if sessions.is_empty() {
                    continue;
                }
                tracing::info!(count = sessions.len(), "session table snapshot");
                for s in sessions.iter() {
                    tracing::info!(session = *s.key(), peer = %s.value().peer, "  session");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let result = listener_task.await;
    session_printer.abort();
    match result {
        Ok(Ok(())) => tracing::info!("recond stopped"),
        Ok(Err(e)) => return Err(e.context("listener failed")),
        Err(e) => return Err(anyhow::anyhow!(e).context("listener task panicked")),
    }
    Ok(())
}
