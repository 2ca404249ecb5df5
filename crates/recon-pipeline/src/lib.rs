//! recon-pipeline — stages, queues, the threaded pipeline and the wire
//! writers that put its results on the connection.

pub mod event;
pub mod inbound;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod stage;
pub mod stages;
pub mod writer;

pub use event::{PipelineEvent, PipelineReport, StageStats, WriterStats};
pub use inbound::{AcquisitionReader, InboundError};
pub use pipeline::{Pipeline, RunningPipeline};
pub use queue::{stage_queue, ChainReceiver, ChainSender, Pulled, QueueError, ShutdownSignal};
pub use registry::StageRegistry;
pub use stage::{Stage, StageError, StageResult, StageState};
pub use writer::{ImageWriter, Segment, WireWriter, WriteError, WriterRegistry};
