pub mod error;
pub mod record;
pub mod sink;
pub mod source;

pub use error::{ErrorKind, SinkError, SourceError};
pub use record::TopicObservation;
pub use sink::{SinkWriter, WriteFailure, WriteReport};
pub use source::{EventSource, LifecycleSignal, SourceChannels};
