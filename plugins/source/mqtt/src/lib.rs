//! MQTT event source. Subscribes to topic filters and reports, for every
//! PUBLISH it receives, the topic it was sent to. Payloads are dropped on
//! arrival.

mod config;
mod driver;
mod pending;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, QoS, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tracker_api::{EventSource, LifecycleSignal, SourceChannels, SourceError};

pub use crate::config::{BrokerAddr, MqttConfig, parse_broker_url};
use crate::pending::SubscriptionTable;

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct Shared {
    pub connected: AtomicBool,
    pub stopping: AtomicBool,
    subscriptions: Mutex<SubscriptionTable>,
}

impl Shared {
    pub fn subscriptions(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    client: AsyncClient,
    lifecycle: mpsc::UnboundedSender<LifecycleSignal>,
    token: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

pub struct MqttSource {
    config: MqttConfig,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    started: AtomicBool,
    /// Keeps queue order equal to request order.
    subscribe_order: tokio::sync::Mutex<()>,
}

impl MqttSource {
    pub fn new(config: MqttConfig) -> Result<Self, SourceError> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                subscriptions: Mutex::new(SubscriptionTable::default()),
            }),
            session: Mutex::new(None),
            started: AtomicBool::new(false),
            subscribe_order: tokio::sync::Mutex::new(()),
        })
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> Result<MqttOptions, SourceError> {
        let broker = self.config.broker()?;
        let mut options = MqttOptions::new(self.config.client_id(), broker.host, broker.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(self.config.clean_session);
        if let Some(user) = &self.config.username {
            options.set_credentials(user.clone(), self.config.password.clone().unwrap_or_default());
        }
        if broker.tls {
            if !self.config.tls_verify {
                tracing::warn!("certificate verification cannot be disabled for mqtts, verifying against system roots");
            }
            options.set_transport(Transport::tls_with_default_config());
        }
        Ok(options)
    }

    fn open(&self) -> Result<SourceChannels, SourceError> {
        use std::sync::atomic::Ordering;

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyStarted);
        }

        let options = self.options()?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (lifecycle_tx, lifecycle) = mpsc::unbounded_channel();
        let (observations_tx, observations) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        tracing::info!(
            url = %self.config.url,
            client_id = %self.config.client_id(),
            namespace = %self.config.namespace,
            keep_alive_s = self.config.keep_alive().as_secs(),
            keepalive_limit = self.config.keepalive_limit,
            "connecting to mqtt broker"
        );

        let driver = tokio::spawn(driver::drive(
            eventloop,
            Arc::clone(&self.shared),
            self.config.clone(),
            lifecycle_tx.clone(),
            observations_tx,
            token.clone(),
        ));

        *self.session() = Some(Session {
            client,
            lifecycle: lifecycle_tx,
            token,
            driver: Some(driver),
        });
        Ok(SourceChannels { lifecycle, observations })
    }

    async fn subscribe_pattern(&self, pattern: String) -> Result<(), SourceError> {
        use std::sync::atomic::Ordering;

        let (client, lifecycle) = match self.session().as_ref() {
            Some(s) => (s.client.clone(), s.lifecycle.clone()),
            None => return Err(SourceError::NotConnected),
        };
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(SourceError::NotConnected);
        }

        let (reply, ack) = oneshot::channel();
        {
            let _order = self.subscribe_order.lock().await;
            self.shared.subscriptions().push(pattern.clone(), reply);
            if let Err(e) = client.subscribe(pattern.clone(), QoS::AtMostOnce).await {
                self.shared.subscriptions().pop_last();
                return Err(SourceError::Subscribe {
                    pattern,
                    reason: e.to_string(),
                });
            }
        }

        let timeout = self.config.subscribe_timeout();
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SourceError::Subscribe {
                pattern,
                reason: "mqtt driver stopped".into(),
            }),
            Err(_) => {
                let _ = lifecycle.send(LifecycleSignal::SubscriptionError {
                    pattern: pattern.clone(),
                    reason: "timed out".into(),
                });
                Err(SourceError::SubscribeTimeout {
                    pattern,
                    timeout_ms: self.config.subscribe_timeout_ms,
                })
            }
        }
    }

    async fn close(&self) -> Result<(), SourceError> {
        use std::sync::atomic::Ordering;

        let (client, token, driver) = match self.session().as_mut() {
            Some(s) => (s.client.clone(), s.token.clone(), s.driver.take()),
            None => return Ok(()),
        };
        let Some(mut driver) = driver else {
            return Ok(());
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        if !self.shared.connected.load(Ordering::SeqCst) {
            token.cancel();
        } else if let Err(e) = client.try_disconnect() {
            tracing::debug!(error = %e, "mqtt disconnect request not queued");
            token.cancel();
        }

        if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
            token.cancel();
            let _ = driver.await;
        }
        token.cancel();
        tracing::info!("mqtt connection released");
        Ok(())
    }
}

impl EventSource for MqttSource {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<SourceChannels, SourceError>> + Send + '_>> {
        Box::pin(async move { self.open() })
    }

    fn subscribe(&self, pattern: &str) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        Box::pin(self.subscribe_pattern(pattern.to_owned()))
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        Box::pin(self.close())
    }
}
