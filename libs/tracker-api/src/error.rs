use std::fmt;

/// Category of an adapter error. Lets the engine tell a permanent
/// misconfiguration from a transient outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration. Permanent, fail at startup.
    Config,
    /// Network or I/O failure. Transient.
    Io,
    /// Response could not be parsed or a document could not be encoded.
    Format,
    /// The remote side answered with an error.
    Remote,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Remote => f.write_str("remote"),
        }
    }
}

/// Error returned by sink adapters outside of the batch write path
/// (bootstrap, close).
#[derive(Debug)]
pub struct SinkError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Remote, message: msg.into() }
    }

    /// Prefix the message, keeping the kind: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

/// Error returned by event source adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("invalid source config: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("subscription '{pattern}' rejected: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("subscription '{pattern}' not acknowledged within {timeout_ms} ms")]
    SubscribeTimeout { pattern: String, timeout_ms: u64 },

    #[error("source is not connected")]
    NotConnected,

    #[error("source already started")]
    AlreadyStarted,
}

impl SourceError {
    /// Pattern the error refers to, for per-subscription failures.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            SourceError::Subscribe { pattern, .. } | SourceError::SubscribeTimeout { pattern, .. } => {
                Some(pattern)
            }
            _ => None,
        }
    }
}
