//! Pipeline assembly and execution.
//!
//! `Pipeline::build` turns the configured stage list into stage instances,
//! and nothing runs until `start`. A running pipeline has one OS thread per
//! stage plus one writer thread, wired by bounded queues:
//!
//! ```text
//! input ─▶ [q0] ─▶ stage 0 ─▶ [q1] ─▶ stage 1 ─▶ … ─▶ [qN] ─▶ writer ─▶ sink
//! ```
//!
//! Two ways to stop:
//!   - `finish` closes the input. Every stage works through what is queued,
//!     runs `close`, and exits; the writer exits last.
//!   - `shutdown` raises the drain flag. Each worker finishes the chain it is
//!     processing and exits at its next pull. Chains still queued are dropped.
//!
//! A fatal stage error or a failed write raises the same drain flag.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use recon_core::config::{ConfigError, PipelineConfig};
use recon_core::MessageChain;

use crate::event::{
    Counters, EventSink, FailureSlot, PipelineEvent, PipelineReport, StageMonitor, StageStats,
    WriterStats,
};
use crate::queue::{stage_queue, ChainReceiver, ChainSender, Pulled, QueueError, ShutdownSignal};
use crate::registry::StageRegistry;
use crate::stage::{check_accepts, Stage, StageError, StageResult, StageState};
use crate::writer::{Segment, WriteError, WriterRegistry};

/// Name used for the writer in events and failures.
pub const WRITER_NAME: &str = "writer";

/// A configured, not yet running pipeline.
pub struct Pipeline {
    stages: Vec<(String, Box<dyn Stage>)>,
    writers: WriterRegistry,
    queue_capacity: usize,
}

impl Pipeline {
    /// Instantiate every configured stage, in order.
    ///
    /// Any unknown kind or invalid parameter set fails the whole build.
    pub fn build(
        config: &PipelineConfig,
        registry: &StageRegistry,
        writers: WriterRegistry,
    ) -> Result<Self, ConfigError> {
        if config.stages.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        let stages = config
            .stages
            .iter()
            .map(|spec| {
                let stage = registry.create(spec)?;
                Ok((spec.display_name().to_string(), stage))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        tracing::debug!(
            stages = stages.len(),
            queue_capacity = config.queue_capacity,
            "pipeline built"
        );
        Ok(Self {
            stages,
            writers,
            queue_capacity: config.queue_capacity,
        })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Spawn the workers. Results are written to `sink`, which is handed back
    /// by `finish`/`shutdown`.
    pub fn start<W>(self, sink: W) -> io::Result<RunningPipeline<W>>
    where
        W: Write + Send + 'static,
    {
        let signal = ShutdownSignal::new();
        let failure = FailureSlot::default();
        let (events, events_rx) = EventSink::channel();

        let (input, mut upstream) = stage_queue(self.queue_capacity);
        let mut running = RunningPipeline {
            input: Some(input),
            signal: signal.clone(),
            events: events_rx,
            monitors: Vec::with_capacity(self.stages.len()),
            workers: Vec::with_capacity(self.stages.len()),
            writer: None,
            failure: failure.clone(),
        };

        for (name, stage) in self.stages {
            let (tx, rx) = stage_queue(self.queue_capacity);
            let monitor = StageMonitor::new(name.clone());
            let worker = StageWorker {
                stage,
                monitor: monitor.clone(),
                input: upstream,
                output: tx,
                signal: signal.clone(),
                events: events.clone(),
                failure: failure.clone(),
            };
            // On a spawn error `running` drops here, which stops and joins
            // whatever was already started.
            let handle = thread::Builder::new()
                .name(format!("stage-{name}"))
                .spawn(move || worker.run())?;
            running.monitors.push(monitor);
            running.workers.push(handle);
            upstream = rx;
        }

        let writer = WriterWorker {
            writers: self.writers,
            input: upstream,
            signal,
            events,
            failure,
        };
        let handle = thread::Builder::new()
            .name(WRITER_NAME.to_string())
            .spawn(move || writer.run(sink))?;
        running.writer = Some(handle);

        tracing::info!(stages = running.monitors.len(), "pipeline started");
        Ok(running)
    }
}

// ── Running pipeline ──────────────────────────────────────────────────────────

/// Handle to a started pipeline.
///
/// Dropping the handle without calling `finish` or `shutdown` behaves like
/// `shutdown`.
pub struct RunningPipeline<W: Write + Send + 'static> {
    input: Option<ChainSender>,
    signal: ShutdownSignal,
    events: Receiver<PipelineEvent>,
    monitors: Vec<StageMonitor>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<(W, WriterStats)>>,
    failure: FailureSlot,
}

impl<W: Write + Send + 'static> RunningPipeline<W> {
    /// Producer end of the first queue. Pushing blocks while it is full.
    pub fn input(&self) -> Option<ChainSender> {
        self.input.clone()
    }

    /// Push one chain into the first queue.
    pub fn submit(&self, chain: MessageChain) -> Result<(), QueueError> {
        match &self.input {
            Some(input) => input.push(chain),
            None => Err(QueueError::Closed(Box::new(chain))),
        }
    }

    /// Event stream of this run.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.clone()
    }

    /// Current counters of every stage, in pipeline order.
    pub fn stats(&self) -> Vec<StageStats> {
        self.monitors.iter().map(StageMonitor::snapshot).collect()
    }

    /// True once shutdown was requested or a worker failed.
    pub fn is_draining(&self) -> bool {
        self.signal.is_triggered()
    }

    /// First unrecoverable failure so far, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.get()
    }

    /// Close the input and let every queued chain run to the sink.
    ///
    /// Other holders of `input()` clones keep the pipeline open until they
    /// drop them.
    pub fn finish(mut self) -> (PipelineReport, Option<W>) {
        tracing::debug!("pipeline input closed, draining");
        self.input.take();
        self.join()
    }

    /// Stop at the next pull boundary of every worker.
    pub fn shutdown(mut self) -> (PipelineReport, Option<W>) {
        tracing::info!("pipeline shutdown requested");
        self.signal.trigger();
        self.input.take();
        self.join()
    }

    fn join(&mut self) -> (PipelineReport, Option<W>) {
        for (handle, monitor) in self.workers.drain(..).zip(&self.monitors) {
            if handle.join().is_err() {
                self.failure
                    .record(format!("{}: worker thread panicked", monitor.name));
                monitor.state.set(StageState::Stopped);
            }
        }

        let (sink, writer) = match self.writer.take().map(JoinHandle::join) {
            Some(Ok((sink, stats))) => (Some(sink), stats),
            Some(Err(_)) => {
                self.failure
                    .record(format!("{WRITER_NAME}: worker thread panicked"));
                (None, WriterStats::default())
            }
            None => (None, WriterStats::default()),
        };

        let report = PipelineReport {
            stages: self.stats(),
            writer,
            failure: self.failure.get(),
        };
        tracing::info!(
            written = report.writer.written,
            refused = report.writer.refused,
            failed = report.failure.is_some(),
            "pipeline stopped"
        );
        (report, sink)
    }
}

impl<W: Write + Send + 'static> Drop for RunningPipeline<W> {
    fn drop(&mut self) {
        if self.workers.is_empty() && self.writer.is_none() {
            return;
        }
        self.signal.trigger();
        self.input.take();
        let _ = self.join();
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

struct StageWorker {
    stage: Box<dyn Stage>,
    monitor: StageMonitor,
    input: ChainReceiver,
    output: ChainSender,
    signal: ShutdownSignal,
    events: EventSink,
    failure: FailureSlot,
}

impl StageWorker {
    fn run(mut self) {
        let accepts = self.stage.accepts();
        self.monitor.state.set(StageState::Running);
        tracing::debug!(stage = %self.monitor.name, "stage running");

        loop {
            match self.input.pull_or_stop(&self.signal) {
                Pulled::Chain(chain) => {
                    Counters::bump(&self.monitor.counters.received);
                    if let Err(error) = check_accepts(accepts, &chain) {
                        self.drop_chain(error);
                        continue;
                    }
                    let stage = &mut self.stage;
                    let result = guarded(|| stage.process(chain));
                    if !self.handle(result) {
                        break;
                    }
                }
                Pulled::Closed => {
                    self.monitor.state.set(StageState::Draining);
                    let stage = &mut self.stage;
                    let result = guarded(|| stage.close());
                    self.handle(result);
                    break;
                }
                Pulled::Stopped => break,
            }
        }

        self.monitor.state.set(StageState::Draining);
        self.monitor.state.set(StageState::Stopped);
        self.events.emit(PipelineEvent::StageStopped {
            stats: self.monitor.snapshot(),
        });
    }

    /// Forward outputs or report the error. False when the worker must stop.
    fn handle(&self, result: StageResult) -> bool {
        match result {
            Ok(outputs) => self.forward(outputs),
            Err(error) if error.is_fatal() => {
                self.fail(error.to_string());
                false
            }
            Err(error) => {
                self.drop_chain(error);
                true
            }
        }
    }

    fn forward(&self, outputs: Vec<MessageChain>) -> bool {
        let mut outputs = outputs.into_iter();
        for chain in outputs.by_ref() {
            if self.output.push(chain).is_err() {
                Counters::bump(&self.monitor.counters.lost);
                self.events.emit(PipelineEvent::ChainLost {
                    stage: self.monitor.name.clone(),
                });
                for _ in outputs {
                    Counters::bump(&self.monitor.counters.lost);
                    self.events.emit(PipelineEvent::ChainLost {
                        stage: self.monitor.name.clone(),
                    });
                }
                return false;
            }
            Counters::bump(&self.monitor.counters.emitted);
        }
        true
    }

    fn drop_chain(&self, error: StageError) {
        Counters::bump(&self.monitor.counters.dropped);
        self.events.emit(PipelineEvent::ChainDropped {
            stage: self.monitor.name.clone(),
            error,
        });
    }

    fn fail(&self, error: String) {
        self.failure
            .record(format!("{}: {error}", self.monitor.name));
        self.signal.trigger();
        self.events.emit(PipelineEvent::StageFailed {
            stage: self.monitor.name.clone(),
            error,
        });
    }
}

/// Run stage code, turning a panic into a fatal error.
fn guarded(f: impl FnOnce() -> StageResult) -> StageResult {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(StageError::fatal(format!("panicked: {message}")))
    })
}

struct WriterWorker {
    writers: WriterRegistry,
    input: ChainReceiver,
    signal: ShutdownSignal,
    events: EventSink,
    failure: FailureSlot,
}

impl WriterWorker {
    fn run<W: Write>(self, mut sink: W) -> (W, WriterStats) {
        let mut stats = WriterStats::default();
        while let Pulled::Chain(chain) = self.input.pull_or_stop(&self.signal) {
            match self.send(&chain, &mut sink) {
                Ok(()) => stats.written += 1,
                Err(error) if error.is_fatal() => {
                    let error = error.to_string();
                    self.failure.record(format!("{WRITER_NAME}: {error}"));
                    self.signal.trigger();
                    self.events.emit(PipelineEvent::StageFailed {
                        stage: WRITER_NAME.to_string(),
                        error,
                    });
                    break;
                }
                Err(error) => {
                    stats.refused += 1;
                    self.events.emit(PipelineEvent::WriteRefused { error });
                }
            }
        }
        (sink, stats)
    }

    fn send<W: Write>(&self, chain: &MessageChain, sink: &mut W) -> Result<(), WriteError> {
        self.writers.write(chain, sink)?;
        sink.flush().map_err(|source| WriteError::Io {
            segment: Segment::Payload,
            source,
        })
    }
}
