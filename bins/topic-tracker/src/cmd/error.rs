use tracker_api::{SinkError, SourceError};
use tracker_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    Config(String),

    #[error("broker: {0}")]
    Source(#[from] SourceError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Engine(#[from] EngineError),
}
