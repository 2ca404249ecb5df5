//! One client connection: inbound acquisitions → pipeline → image messages.
//!
//! Runs on a blocking thread. The socket is split into a reader (inbound
//! messages) and a writer (the pipeline sink); both are clones of the same
//! std `TcpStream`.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use zerocopy::AsBytes;

use recon_core::config::PipelineConfig;
use recon_core::wire::{MessageIdentifier, MSG_CLOSE};
use recon_pipeline::{AcquisitionReader, Pipeline, PipelineReport, StageRegistry, WriterRegistry};

pub type SessionId = u64;

/// Entry of the live session table.
pub struct SessionHandle {
    pub peer: SocketAddr,
    stream: TcpStream,
    stop: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(peer: SocketAddr, stream: &TcpStream) -> Result<(Self, Arc<AtomicBool>)> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = Self {
            peer,
            stream: stream.try_clone().context("failed to clone session socket")?,
            stop: stop.clone(),
        };
        Ok((handle, stop))
    }

    /// Ask the session to shut its pipeline down. Unblocks a pending read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Read);
    }
}

/// How the inbound side ended.
#[derive(Debug)]
enum Ended {
    /// CLOSE or end of file.
    Close,
    /// The pipeline stopped accepting input.
    PipelineStopped,
    /// Bad framing or a read error.
    Failed(anyhow::Error),
}

/// Serve one connection until the client closes it, the pipeline fails, or
/// `stop` is raised. Acquisitions carrying more than `max_readout_bytes` of
/// samples end the session.
pub fn run(
    id: SessionId,
    stream: TcpStream,
    config: &PipelineConfig,
    registry: &StageRegistry,
    max_readout_bytes: usize,
    stop: &AtomicBool,
) -> Result<PipelineReport> {
    let pipeline = match Pipeline::build(config, registry, WriterRegistry::with_image_writers()) {
        Ok(p) => p,
        Err(e) => {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e).context("pipeline configuration rejected");
        }
    };

    let sink = BufWriter::new(stream.try_clone().context("failed to clone socket")?);
    let running = pipeline.start(sink).context("failed to start pipeline")?;
    tracing::info!(session = id, "pipeline running");

    let mut reader =
        AcquisitionReader::new(BufReader::new(&stream)).with_max_readout_bytes(max_readout_bytes);
    let ended = loop {
        match reader.next_chain() {
            Ok(Some(chain)) => {
                if running.submit(chain).is_err() {
                    break Ended::PipelineStopped;
                }
            }
            Ok(None) => break Ended::Close,
            Err(e) => break Ended::Failed(e.into()),
        }
    };
    tracing::debug!(session = id, acquisitions = reader.received(), ?ended, "inbound finished");

    let (report, sink) = if stop.load(Ordering::Acquire) || !matches!(ended, Ended::Close) {
        running.shutdown()
    } else {
        running.finish()
    };

    if let Some(mut sink) = sink {
        if report.failure.is_none() {
            let close = MessageIdentifier::new(MSG_CLOSE);
            sink.write_all(close.as_bytes())
                .and_then(|()| sink.flush())
                .context("failed to send close")?;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);

    if let Ended::Failed(e) = ended {
        return Err(e.context("inbound stream rejected"));
    }
    Ok(report)
}
