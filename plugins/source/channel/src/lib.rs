//! In-process event source. A [`ChannelHandle`] plays the broker: it
//! reports lifecycle changes and pushes observations, and can be told to
//! reject subscriptions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use tracker_api::{EventSource, LifecycleSignal, SourceChannels, SourceError, TopicObservation};

const DEFAULT_NAMESPACE: &str = "default";

struct Shared {
    namespace: String,
    auto_connect: bool,
    channels: Mutex<Option<SourceChannels>>,
    lifecycle_tx: Mutex<Option<mpsc::UnboundedSender<LifecycleSignal>>>,
    observations_tx: Mutex<Option<mpsc::UnboundedSender<TopicObservation>>>,
    connected: AtomicBool,
    rejected: Mutex<HashMap<String, String>>,
    subscribe_calls: Mutex<Vec<String>>,
    disconnect_calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn signal(&self, signal: LifecycleSignal) -> bool {
        match signal {
            LifecycleSignal::Connected => self.connected.store(true, Ordering::SeqCst),
            LifecycleSignal::Disconnected { .. }
            | LifecycleSignal::Reconnecting { .. }
            | LifecycleSignal::ConnectFailed { .. } => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        lock(&self.lifecycle_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }
}

// ═══════════════════════════════════════════════════════════════
//  ChannelSource
// ═══════════════════════════════════════════════════════════════

pub struct ChannelSource {
    shared: Arc<Shared>,
}

/// Broker side of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelSource {
    /// Source that reports `Connected` as soon as `connect` is called.
    pub fn new() -> (ChannelSource, ChannelHandle) {
        Self::build(DEFAULT_NAMESPACE, true)
    }

    /// Source that stays in `Connecting` until the handle says otherwise.
    pub fn manual() -> (ChannelSource, ChannelHandle) {
        Self::build(DEFAULT_NAMESPACE, false)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> (ChannelSource, ChannelHandle) {
        Self::build(&namespace.into(), true)
    }

    fn build(namespace: &str, auto_connect: bool) -> (ChannelSource, ChannelHandle) {
        let (lifecycle_tx, lifecycle) = mpsc::unbounded_channel();
        let (observations_tx, observations) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            namespace: namespace.to_owned(),
            auto_connect,
            channels: Mutex::new(Some(SourceChannels { lifecycle, observations })),
            lifecycle_tx: Mutex::new(Some(lifecycle_tx)),
            observations_tx: Mutex::new(Some(observations_tx)),
            connected: AtomicBool::new(false),
            rejected: Mutex::new(HashMap::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            disconnect_calls: AtomicUsize::new(0),
        });
        (
            ChannelSource { shared: Arc::clone(&shared) },
            ChannelHandle { shared },
        )
    }
}

impl EventSource for ChannelSource {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<SourceChannels, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let channels = lock(&self.shared.channels).take().ok_or(SourceError::AlreadyStarted)?;
            if self.shared.auto_connect {
                self.shared.signal(LifecycleSignal::Connected);
            }
            Ok(channels)
        })
    }

    fn subscribe(&self, pattern: &str) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let pattern = pattern.to_owned();
        Box::pin(async move {
            lock(&self.shared.subscribe_calls).push(pattern.clone());

            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(SourceError::NotConnected);
            }

            let rejection = lock(&self.shared.rejected).get(&pattern).cloned();
            match rejection {
                Some(reason) => {
                    self.shared.signal(LifecycleSignal::SubscriptionError {
                        pattern: pattern.clone(),
                        reason: reason.clone(),
                    });
                    Err(SourceError::Subscribe { pattern, reason })
                }
                None => {
                    self.shared.signal(LifecycleSignal::SubscriptionAck { pattern });
                    Ok(())
                }
            }
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        Box::pin(async move {
            self.shared.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.shared.connected.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  ChannelHandle
// ═══════════════════════════════════════════════════════════════

impl ChannelHandle {
    pub fn connected(&self) -> bool {
        self.shared.signal(LifecycleSignal::Connected)
    }

    pub fn disconnected(&self, reason: impl Into<String>) -> bool {
        self.shared.signal(LifecycleSignal::Disconnected { reason: reason.into() })
    }

    pub fn reconnecting(&self, attempt: u32) -> bool {
        self.shared.signal(LifecycleSignal::Reconnecting { attempt })
    }

    /// Terminal failure; nothing follows it.
    pub fn connect_failed(&self, reason: impl Into<String>) -> bool {
        let sent = self.shared.signal(LifecycleSignal::ConnectFailed { reason: reason.into() });
        lock(&self.shared.observations_tx).take();
        lock(&self.shared.lifecycle_tx).take();
        sent
    }

    /// Deliver a message on `topic`. Returns false (and delivers nothing)
    /// while the source is not connected.
    pub fn observe(&self, topic: impl Into<String>) -> bool {
        let observation = TopicObservation::now(topic, self.shared.namespace.clone());
        self.send(observation)
    }

    pub fn send(&self, observation: TopicObservation) -> bool {
        if !self.shared.connected.load(Ordering::SeqCst) {
            tracing::debug!(topic = %observation.topic, "dropped, source not connected");
            return false;
        }
        lock(&self.shared.observations_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(observation).is_ok())
    }

    /// Reject future subscriptions to `pattern`.
    pub fn reject(&self, pattern: impl Into<String>, reason: impl Into<String>) {
        lock(&self.shared.rejected).insert(pattern.into(), reason.into());
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        lock(&self.shared.subscribe_calls).clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.shared.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Drop both outbound streams, as an adapter that died would.
    pub fn close(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.shared.observations_tx).take();
        lock(&self.shared.lifecycle_tx).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_hands_out_streams_once() {
        let (source, handle) = ChannelSource::new();
        let mut channels = source.connect().await.unwrap();
        assert_eq!(channels.lifecycle.recv().await, Some(LifecycleSignal::Connected));

        assert!(handle.observe("a/b"));
        let obs = channels.observations.recv().await.unwrap();
        assert_eq!(obs.topic, "a/b");
        assert_eq!(obs.namespace, "default");

        assert_eq!(source.connect().await.err(), Some(SourceError::AlreadyStarted));
    }

    #[tokio::test]
    async fn nothing_is_delivered_while_disconnected() {
        let (source, handle) = ChannelSource::manual();
        let mut channels = source.connect().await.unwrap();

        assert!(!handle.observe("early"));
        handle.connected();
        handle.disconnected("link down");
        assert!(!handle.observe("during outage"));
        handle.connected();
        assert!(handle.observe("after"));

        assert_eq!(channels.observations.recv().await.unwrap().topic, "after");
    }

    #[tokio::test]
    async fn rejected_pattern_fails_with_signal() {
        let (source, handle) = ChannelSource::new();
        let mut channels = source.connect().await.unwrap();
        handle.reject("secret/#", "not authorized");

        assert!(source.subscribe("orders/#").await.is_ok());
        let err = source.subscribe("secret/#").await.unwrap_err();
        assert_eq!(err.pattern(), Some("secret/#"));

        assert_eq!(channels.lifecycle.recv().await, Some(LifecycleSignal::Connected));
        assert_eq!(
            channels.lifecycle.recv().await,
            Some(LifecycleSignal::SubscriptionAck { pattern: "orders/#".into() })
        );
        assert!(matches!(
            channels.lifecycle.recv().await,
            Some(LifecycleSignal::SubscriptionError { .. })
        ));
        assert_eq!(handle.subscribe_calls(), ["orders/#", "secret/#"]);
    }
}
