use tracker_api::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sink bootstrap failed: {0}")]
    SinkInit(#[from] SinkError),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("event source lost: {0}")]
    SourceLost(String),
}

impl EngineError {
    /// True for failures that happen before ingestion ever started.
    pub fn is_startup(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::SinkInit(_) | EngineError::Connection(_))
    }
}
