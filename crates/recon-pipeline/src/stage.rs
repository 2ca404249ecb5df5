//! Stage trait for chain-processing pipeline stages.
//!
//! Every reconstruction step is a stage. This trait is the contract between
//! the pipeline (which owns the worker thread and the queues) and the stage
//! logic (which interprets chains).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::{ChainError, MessageChain, PayloadKind};

/// Output of one `process` call.
pub type StageResult = Result<Vec<MessageChain>, StageError>;

/// A pipeline stage.
///
/// Intentionally minimal: configure once, then process chains one at a time
/// on a dedicated thread. Any state a stage keeps between calls is private
/// to it.
pub trait Stage: Send {
    /// Validate `spec.params` and build the stage. Runs before the pipeline
    /// starts; an error here prevents startup.
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError>
    where
        Self: Sized;

    /// The (header, payload) kinds this stage takes. Chains of any other
    /// shape are rejected by the worker before `process` sees them.
    fn accepts(&self) -> (PayloadKind, PayloadKind);

    /// Handle one chain. Returning no chains is normal for stages that
    /// buffer until enough data has arrived.
    fn process(&mut self, chain: MessageChain) -> StageResult;

    /// Called once after the input has closed, so buffered state can be
    /// flushed downstream.
    fn close(&mut self) -> StageResult {
        Ok(Vec::new())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// The chain head does not match what the stage accepts.
    #[error("type mismatch: stage accepts ({}, {}), chain is {found:?}", .expected.0, .expected.1)]
    TypeMismatch {
        expected: (PayloadKind, PayloadKind),
        found: Vec<PayloadKind>,
    },

    #[error("malformed chain: {0}")]
    Chain(#[from] ChainError),

    #[error("malformed chain: {0}")]
    Malformed(String),

    /// Internal invariant violated; the stage cannot continue.
    #[error("stage fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Fatal errors stop the stage and drain the whole pipeline. Everything
    /// else only costs the chain that caused it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Check a chain against a stage's declared (header, payload) kinds.
pub fn check_accepts(
    accepts: (PayloadKind, PayloadKind),
    chain: &MessageChain,
) -> Result<(), StageError> {
    let head = chain.head_kind();
    let payload = chain.get(1).map(|node| node.kind());
    if head == accepts.0 && payload == Some(accepts.1) {
        Ok(())
    } else {
        Err(StageError::TypeMismatch {
            expected: accepts,
            found: chain.kinds(),
        })
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// Lifecycle of a stage worker: Idle → Running → Draining → Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Shared view of a worker's state, readable from other threads.
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> StageState {
        StageState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
