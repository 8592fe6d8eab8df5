//! Ingestion core: attaches to an [`EventSource`](tracker_api::EventSource),
//! batches topic observations and forwards them to a
//! [`SinkWriter`](tracker_api::SinkWriter).

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flush;

pub use buffer::BatchBuffer;
pub use config::{IngestConfig, PartialFailurePolicy};
pub use coordinator::{ConnectionState, Coordinator, CoordinatorState, CoordinatorStatus, IngestReport};
pub use error::EngineError;
pub use flush::{FlushDecision, FlushPolicy, FlushTrigger};
