use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::record::TopicObservation;

/// Health of the broker connection, as reported by an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Session is up. Emitted on first connect and after every reconnect.
    Connected,
    /// Session dropped. The adapter retries on its own.
    Disconnected { reason: String },
    /// The adapter is attempting to re-establish the session.
    Reconnecting { attempt: u32 },
    /// The broker confirmed a subscription.
    SubscriptionAck { pattern: String },
    /// The broker rejected a subscription, or it timed out.
    SubscriptionError { pattern: String, reason: String },
    /// Terminal: retries exhausted, no further signals follow.
    ConnectFailed { reason: String },
}

impl LifecycleSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleSignal::ConnectFailed { .. })
    }
}

/// Receivers handed out by [`EventSource::connect`].
///
/// Both channels are unbounded: while the consumer is not reading
/// observations, they are held here rather than dropped.
pub struct SourceChannels {
    pub lifecycle: mpsc::UnboundedReceiver<LifecycleSignal>,
    pub observations: mpsc::UnboundedReceiver<TopicObservation>,
}

/// Broker-side capability the engine depends on.
///
/// Implementations own the broker connection, run their own reconnect loop,
/// and must not emit observations while disconnected.
pub trait EventSource: Send + Sync {
    /// Start connecting. Can be called once; the returned streams are not
    /// restartable.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<SourceChannels, SourceError>> + Send + '_>>;

    /// Subscribe to a topic pattern. Resolves on ack, rejection or timeout.
    fn subscribe(&self, pattern: &str) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;

    /// Release the connection. Idempotent.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;
}
