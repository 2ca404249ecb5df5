//! TCP accept loop. Each connection gets its own session on a blocking thread.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use recon_core::config::PipelineConfig;
use recon_pipeline::StageRegistry;

use crate::session::{self, SessionHandle, SessionId};

pub type SessionTable = Arc<DashMap<SessionId, SessionHandle>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

pub struct ConnectionListener {
    listener: TcpListener,
    config: Arc<PipelineConfig>,
    registry: Arc<StageRegistry>,
    max_readout_bytes: usize,
    sessions: SessionTable,
    shutdown: broadcast::Receiver<()>,
    next_id: SessionId,
}

impl ConnectionListener {
    pub fn new(
        listener: TcpListener,
        config: Arc<PipelineConfig>,
        registry: Arc<StageRegistry>,
        max_readout_bytes: usize,
        sessions: SessionTable,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            config,
            registry,
            max_readout_bytes,
            sessions,
            shutdown,
            next_id: 1,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(live = self.sessions.len(), "listener shutting down");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "session task panicked");
                    }
                }

                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = self.spawn_session(&mut tasks, stream, peer) {
                        tracing::warn!(%peer, error = %e, "failed to start session");
                    }
                }
            }
        }

        for entry in self.sessions.iter() {
            tracing::debug!(session = *entry.key(), peer = %entry.value().peer, "stopping session");
            entry.value().stop();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "session task panicked");
            }
        }
        Ok(())
    }

    fn spawn_session(
        &mut self,
        tasks: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
    ) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let stream = stream.into_std().context("failed to detach socket")?;
        stream
            .set_nonblocking(false)
            .context("failed to make socket blocking")?;

        let (handle, stop) = SessionHandle::new(peer, &stream)?;
        self.sessions.insert(id, handle);
        tracing::info!(session = id, %peer, "session opened");

        let config = self.config.clone();
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let max_readout_bytes = self.max_readout_bytes;
        tasks.spawn_blocking(move || {
            match session::run(id, stream, &config, &registry, max_readout_bytes, &stop) {
                Ok(report) => tracing::info!(
                    session = id,
                    images = report.writer.written,
                    refused = report.writer.refused,
                    failure = report.failure.as_deref().unwrap_or("none"),
                    "session closed"
                ),
                Err(e) => tracing::warn!(session = id, error = %format!("{e:#}"), "session ended with error"),
            }
            sessions.remove(&id);
        });
        Ok(())
    }
}
