//! Pipeline events, counters and the final run report.
//!
//! Every event is logged through `tracing` when it is raised and also queued
//! on a bounded channel for whoever holds `RunningPipeline::events()`. When
//! nobody drains that channel, events past its capacity are only logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::stage::{StageError, StageState, StateCell};
use crate::writer::WriteError;

/// Capacity of the event channel. While it is full, new events are logged
/// but not queued.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum PipelineEvent {
    /// A stage rejected or failed on one chain and carried on.
    ChainDropped { stage: String, error: StageError },
    /// The writer refused a chain; nothing was sent for it.
    WriteRefused { error: WriteError },
    /// A stage output could not be handed downstream because the next worker
    /// has exited.
    ChainLost { stage: String },
    /// A worker hit an unrecoverable error. The pipeline is draining.
    StageFailed { stage: String, error: String },
    /// A worker exited.
    StageStopped { stats: StageStats },
}

/// Raises events: logs, then queues without blocking.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<PipelineEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::ChainDropped { stage, error } => {
                tracing::warn!(stage = %stage, error = %error, "chain dropped");
            }
            PipelineEvent::WriteRefused { error } => {
                tracing::warn!(error = %error, "write refused");
            }
            PipelineEvent::ChainLost { stage } => {
                tracing::warn!(stage = %stage, "downstream closed, chain lost");
            }
            PipelineEvent::StageFailed { stage, error } => {
                tracing::error!(stage = %stage, error = %error, "stage failed, draining pipeline");
            }
            PipelineEvent::StageStopped { stats } => {
                tracing::debug!(
                    stage = %stats.name,
                    received = stats.received,
                    emitted = stats.emitted,
                    dropped = stats.dropped,
                    lost = stats.lost,
                    "stage stopped"
                );
            }
        }
        let _ = self.tx.try_send(event);
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) received: AtomicU64,
    pub(crate) emitted: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) lost: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Live view of one stage, shared between its worker and the pipeline handle.
#[derive(Clone)]
pub(crate) struct StageMonitor {
    pub(crate) name: String,
    pub(crate) state: StateCell,
    pub(crate) counters: Arc<Counters>,
}

impl StageMonitor {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StateCell::default(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            state: self.state.get(),
            received: self.counters.received.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            lost: self.counters.lost.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one stage at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStats {
    pub name: String,
    pub state: StageState,
    /// Chains pulled from the input queue.
    pub received: u64,
    /// Chains handed to the next queue.
    pub emitted: u64,
    /// Chains rejected or failed on, reported as `ChainDropped`.
    pub dropped: u64,
    /// Outputs that could not be handed downstream.
    pub lost: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub refused: u64,
}

/// First unrecoverable failure of a run. Later failures are only logged.
#[derive(Clone, Default)]
pub(crate) struct FailureSlot(Arc<Mutex<Option<String>>>);

impl FailureSlot {
    pub(crate) fn record(&self, failure: String) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.get_or_insert(failure);
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Outcome of a finished pipeline.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stages: Vec<StageStats>,
    pub writer: WriterStats,
    /// Set when a stage or the writer failed and forced the drain.
    pub failure: Option<String>,
}

impl PipelineReport {
    /// No failure, and every chain that entered made it to the wire.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
            && self.writer.refused == 0
            && self.stages.iter().all(|s| s.dropped == 0 && s.lost == 0)
    }

    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_wins() {
        let slot = FailureSlot::default();
        assert_eq!(slot.get(), None);
        slot.record("writer: broken pipe".into());
        slot.clone().record("accumulate_image: shape changed".into());
        assert_eq!(slot.get().as_deref(), Some("writer: broken pipe"));
    }

    #[test]
    fn full_event_channel_does_not_block() {
        let (sink, rx) = EventSink::channel();
        for _ in 0..EVENT_CAPACITY + 10 {
            sink.emit(PipelineEvent::ChainLost {
                stage: "s".into(),
            });
        }
        assert_eq!(rx.len(), EVENT_CAPACITY);
    }

    #[test]
    fn snapshot_reads_counters() {
        let monitor = StageMonitor::new("extract");
        Counters::bump(&monitor.counters.received);
        Counters::bump(&monitor.counters.received);
        Counters::bump(&monitor.counters.emitted);
        monitor.state.set(StageState::Running);

        let stats = monitor.snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.state, StageState::Running);

        let report = PipelineReport {
            stages: vec![stats],
            writer: WriterStats::default(),
            failure: None,
        };
        assert!(report.is_clean());
        assert!(report.stage("extract").is_some());
    }
}
