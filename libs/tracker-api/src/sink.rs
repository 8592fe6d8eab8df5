use std::future::Future;
use std::pin::Pin;

use crate::error::SinkError;
use crate::record::TopicObservation;

/// Successful write of a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
}

/// A batch that was not accepted as a whole.
///
/// `accepted` counts records the sink did take; they will be written again
/// if the batch is retried in full. `rejected` lists batch positions the
/// sink refused, when it can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub reason: String,
    pub accepted: usize,
    pub rejected: Option<Vec<usize>>,
}

impl WriteFailure {
    /// Nothing was accepted (transport error, timeout, HTTP error...).
    pub fn total(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            accepted: 0,
            rejected: None,
        }
    }

    /// Some records were accepted, the ones at `rejected` were not.
    pub fn partial(reason: impl Into<String>, accepted: usize, rejected: Vec<usize>) -> Self {
        Self {
            reason: reason.into(),
            accepted,
            rejected: Some(rejected),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.accepted > 0
    }
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} accepted)", self.reason, self.accepted)
    }
}

/// Durable sink the engine forwards batches to.
///
/// `write` is atomic from the engine's point of view: anything short of full
/// acceptance is a [`WriteFailure`].
pub trait SinkWriter: Send + Sync {
    /// Verify connectivity and create the target collection if absent.
    /// Calling it again must be a no-op.
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    fn write<'a>(
        &'a self,
        batch: &'a [TopicObservation],
    ) -> Pin<Box<dyn Future<Output = Result<WriteReport, WriteFailure>> + Send + 'a>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;
}
