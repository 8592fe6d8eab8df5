use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tracker_api::{
    EventSource, LifecycleSignal, SinkWriter, SourceChannels, TopicObservation, WriteFailure, WriteReport,
};

use crate::buffer::BatchBuffer;
use crate::config::{IngestConfig, PartialFailurePolicy};
use crate::error::EngineError;
use crate::flush::{FlushDecision, FlushPolicy, FlushTrigger};

const PROGRESS_EVERY: u64 = 1_000;

type WriteOutcome = (Vec<TopicObservation>, Result<WriteReport, WriteFailure>);
type WriteFuture = Pin<Box<dyn Future<Output = WriteOutcome> + Send>>;
type SubscribeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

// ═══════════════════════════════════════════════════════════════
//  State
// ═══════════════════════════════════════════════════════════════

/// Lifecycle of one ingestion run. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Broker connection as last reported by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot published after every event the coordinator handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub connection: ConnectionState,
    /// Subscriptions are being (re)issued; observations are held meanwhile.
    pub subscribing: bool,
    pub buffered: usize,
    pub in_flight: bool,
    pub observed: u64,
    pub written: u64,
    pub write_failures: u64,
}

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub observed: u64,
    pub written: u64,
    pub write_failures: u64,
    /// Records put back into the buffer after failed writes (counted per requeue).
    pub requeued: u64,
    /// Records dropped at shutdown because the final flush never succeeded.
    pub lost: u64,
}

enum Exit {
    Shutdown,
    SourceLost(String),
}

// ═══════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════

/// Single owner of the buffer and the connection state.
///
/// Lifecycle signals, observations, timer ticks, write completions and the
/// shutdown request are merged into one `select!` loop, so buffer appends
/// and drains never interleave. The sink write runs as a boxed future polled
/// by the same loop: appends continue while it is in flight, and at most one
/// write exists at a time.
pub struct Coordinator {
    config: IngestConfig,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn SinkWriter>,
    policy: FlushPolicy,
    buffer: BatchBuffer,
    state: CoordinatorState,
    connection: ConnectionState,
    subscribing: bool,
    in_flight: Option<WriteFuture>,
    resubscribe: Option<SubscribeFuture>,
    deferred: Option<FlushTrigger>,
    /// A write failed; its records wait for the next timer tick.
    retry_pending: bool,
    ticker: Option<Interval>,
    report: IngestReport,
    status: watch::Sender<CoordinatorStatus>,
}

impl Coordinator {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn SinkWriter>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (status, _) = watch::channel(CoordinatorStatus {
            state: CoordinatorState::Idle,
            connection: ConnectionState::Disconnected,
            subscribing: false,
            buffered: 0,
            in_flight: false,
            observed: 0,
            written: 0,
            write_failures: 0,
        });

        Ok(Self {
            policy: FlushPolicy::new(config.batch_size),
            buffer: BatchBuffer::new(config.buffer_warn_threshold),
            config,
            source,
            sink,
            state: CoordinatorState::Idle,
            connection: ConnectionState::Disconnected,
            subscribing: false,
            in_flight: None,
            resubscribe: None,
            deferred: None,
            retry_pending: false,
            ticker: None,
            report: IngestReport::default(),
            status,
        })
    }

    pub fn status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` is cancelled or the event source gives up.
    ///
    /// Startup failures (sink bootstrap, initial connection) return before
    /// anything is ingested. Once ingestion started, the buffer is always
    /// drained before returning, including on [`EngineError::SourceLost`].
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<IngestReport, EngineError> {
        self.set_state(CoordinatorState::Starting);

        let sink = Arc::clone(&self.sink);
        if let Err(e) = sink.init().await {
            tracing::error!(error = %e, "sink bootstrap failed");
            self.set_state(CoordinatorState::Stopped);
            return Err(EngineError::SinkInit(e));
        }

        self.connection = ConnectionState::Connecting;
        self.publish();
        let source = Arc::clone(&self.source);
        let SourceChannels {
            mut lifecycle,
            mut observations,
        } = match source.connect().await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::error!(error = %e, "broker connect failed");
                self.release().await;
                return Err(EngineError::Connection(e.to_string()));
            }
        };

        let exit = self.drive(&mut lifecycle, &mut observations, &shutdown).await;

        let exit = match (self.state, exit) {
            (CoordinatorState::Starting, Exit::SourceLost(reason)) => {
                tracing::error!(reason = %reason, "broker never became available");
                self.release().await;
                return Err(EngineError::Connection(reason));
            }
            (_, exit) => exit,
        };

        self.drain(&mut observations).await;
        self.release().await;

        match exit {
            Exit::Shutdown => Ok(self.report),
            Exit::SourceLost(reason) => Err(EngineError::SourceLost(reason)),
        }
    }

    async fn drive(
        &mut self,
        lifecycle: &mut mpsc::UnboundedReceiver<LifecycleSignal>,
        observations: &mut mpsc::UnboundedReceiver<TopicObservation>,
        shutdown: &CancellationToken,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    return Exit::Shutdown;
                }

                signal = lifecycle.recv() => match signal {
                    Some(signal) => {
                        if let Some(exit) = self.on_signal(signal) {
                            return exit;
                        }
                    }
                    None => return Exit::SourceLost("lifecycle stream closed".into()),
                },

                outcome = settle(&mut self.in_flight) => self.on_write_settled(outcome),

                () = settle(&mut self.resubscribe) => self.on_subscribed(),

                () = tick(&mut self.ticker) => self.on_trigger(FlushTrigger::Timer),

                observation = observations.recv(), if self.accepting() => match observation {
                    Some(observation) => self.on_observation(observation),
                    None => return Exit::SourceLost("observation stream closed".into()),
                },
            }
            self.publish();
        }
    }

    fn accepting(&self) -> bool {
        self.connection == ConnectionState::Connected && !self.subscribing
    }

    // ── Lifecycle ──────────────────────────────────────────────

    fn on_signal(&mut self, signal: LifecycleSignal) -> Option<Exit> {
        match signal {
            LifecycleSignal::Connected => {
                let reconnect = self.connection == ConnectionState::Reconnecting
                    || self.connection == ConnectionState::Disconnected;
                self.connection = ConnectionState::Connected;
                if reconnect {
                    tracing::info!("broker reconnected, re-issuing subscriptions");
                } else {
                    tracing::info!("broker connected");
                }
                self.start_subscriptions();
            }
            LifecycleSignal::Disconnected { reason } => {
                self.connection = ConnectionState::Disconnected;
                tracing::warn!(
                    reason = %reason,
                    buffered = self.buffer.len(),
                    "broker disconnected, ingestion suspended"
                );
            }
            LifecycleSignal::Reconnecting { attempt } => {
                self.connection = ConnectionState::Reconnecting;
                tracing::info!(attempt, "broker reconnecting");
            }
            LifecycleSignal::SubscriptionAck { pattern } => {
                tracing::debug!(pattern = %pattern, "subscription acknowledged");
            }
            LifecycleSignal::SubscriptionError { pattern, reason } => {
                tracing::debug!(pattern = %pattern, reason = %reason, "subscription rejected");
            }
            LifecycleSignal::ConnectFailed { reason } => {
                self.connection = ConnectionState::Disconnected;
                tracing::error!(reason = %reason, "broker connection failed for good");
                return Some(Exit::SourceLost(reason));
            }
        }
        None
    }

    fn start_subscriptions(&mut self) {
        if self.resubscribe.is_some() {
            tracing::debug!("subscription round superseded by a newer connection");
        }
        self.subscribing = true;
        self.resubscribe = Some(Box::pin(subscribe_all(
            Arc::clone(&self.source),
            self.config.subscriptions.clone(),
        )));
    }

    fn on_subscribed(&mut self) {
        self.subscribing = false;
        if self.state == CoordinatorState::Starting {
            let period = self.config.flush_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
            self.set_state(CoordinatorState::Running);
            tracing::info!(
                batch_size = self.config.batch_size,
                flush_interval_ms = self.config.flush_interval_ms,
                "ingestion running"
            );
        } else if self.connection == ConnectionState::Connected {
            tracing::info!(buffered = self.buffer.len(), "subscriptions restored, ingestion resumed");
        }
    }

    // ── Buffer & flush ─────────────────────────────────────────

    fn on_observation(&mut self, observation: TopicObservation) {
        tracing::trace!(topic = %observation.topic, "observed");
        self.buffer.append(observation);
        self.report.observed += 1;
        if self.report.observed % PROGRESS_EVERY == 0 {
            tracing::info!(
                observed = self.report.observed,
                written = self.report.written,
                buffered = self.buffer.len(),
                "ingestion progress"
            );
        }
        self.on_trigger(FlushTrigger::Size);
    }

    fn on_trigger(&mut self, trigger: FlushTrigger) {
        if trigger > FlushTrigger::Size {
            self.retry_pending = false;
        }
        let decision = self
            .policy
            .decide(trigger, self.buffer.len(), self.in_flight.is_some(), self.retry_pending);
        match decision {
            FlushDecision::Flush => self.begin_flush(trigger),
            FlushDecision::Defer => self.defer(trigger),
            FlushDecision::Idle => {}
        }
    }

    fn defer(&mut self, trigger: FlushTrigger) {
        self.deferred = Some(self.deferred.map_or(trigger, |d| d.max(trigger)));
    }

    /// Write at most one batch. A timer flush that leaves records behind
    /// stays deferred and continues once this write succeeds.
    fn begin_flush(&mut self, trigger: FlushTrigger) {
        let batch = self.buffer.drain_batch(self.policy.batch_size());
        if trigger > FlushTrigger::Size && !self.buffer.is_empty() {
            self.defer(trigger);
        }
        tracing::debug!(records = batch.len(), remaining = self.buffer.len(), "flushing batch");
        let sink = Arc::clone(&self.sink);
        self.in_flight = Some(Box::pin(async move {
            let result = sink.write(&batch).await;
            (batch, result)
        }));
    }

    fn on_write_settled(&mut self, (batch, result): WriteOutcome) {
        let succeeded = result.is_ok();
        self.apply_outcome(batch, result);
        self.retry_pending = !succeeded;

        let deferred = self.deferred.take();
        if self.state != CoordinatorState::Draining
            && self.policy.after_settle(succeeded, deferred, self.buffer.len()) == FlushDecision::Flush
        {
            self.begin_flush(deferred.unwrap_or(FlushTrigger::Size));
        }
    }

    /// Book a finished write: count it on success, requeue on failure.
    fn apply_outcome(&mut self, batch: Vec<TopicObservation>, result: Result<WriteReport, WriteFailure>) {
        let failure = match result {
            Ok(_) => {
                tracing::debug!(records = batch.len(), "batch written");
                self.report.written += batch.len() as u64;
                self.buffer.rearm_warning();
                return;
            }
            Err(failure) => failure,
        };

        self.report.write_failures += 1;
        let size = batch.len();
        let retry = self.retry_set(batch, &failure);
        let committed = size - retry.len();
        self.report.written += committed as u64;
        self.report.requeued += retry.len() as u64;

        tracing::error!(
            error = %failure.reason,
            records = size,
            accepted = failure.accepted,
            requeued = retry.len(),
            "sink write failed, batch requeued"
        );
        if failure.is_partial() && committed == 0 {
            tracing::warn!(
                duplicates = failure.accepted,
                "retrying a partially accepted batch, accepted records will be written again"
            );
        }

        self.buffer.prepend(retry);
    }

    fn retry_set(&self, batch: Vec<TopicObservation>, failure: &WriteFailure) -> Vec<TopicObservation> {
        let rejected = match (self.config.partial_failure, &failure.rejected) {
            (PartialFailurePolicy::RetryRejected, Some(rejected)) if !rejected.is_empty() => rejected,
            _ => return batch,
        };

        let mut keep = vec![false; batch.len()];
        for &pos in rejected {
            if let Some(slot) = keep.get_mut(pos) {
                *slot = true;
            }
        }
        batch
            .into_iter()
            .zip(keep)
            .filter_map(|(record, retry)| retry.then_some(record))
            .collect()
    }

    // ── Shutdown ───────────────────────────────────────────────

    async fn drain(&mut self, observations: &mut mpsc::UnboundedReceiver<TopicObservation>) {
        self.set_state(CoordinatorState::Draining);
        self.ticker = None;
        self.resubscribe = None;
        self.deferred = None;

        // The source only emits while connected, so everything still queued
        // was observed before any disconnect that followed.
        let mut queued = 0u64;
        while let Ok(observation) = observations.try_recv() {
            self.buffer.append(observation);
            queued += 1;
        }
        if queued > 0 {
            tracing::debug!(queued, "ingested observations queued at shutdown");
            self.report.observed += queued;
        }

        if let Some(write) = self.in_flight.take() {
            tracing::info!("waiting for in-flight write");
            let (batch, result) = write.await;
            self.apply_outcome(batch, result);
        }

        let sink = Arc::clone(&self.sink);
        let mut failures = 0;
        while !self.buffer.is_empty() && failures < self.config.shutdown_attempts {
            let batch = self.buffer.drain_batch(self.policy.batch_size());
            tracing::info!(
                records = batch.len(),
                remaining = self.buffer.len(),
                attempt = failures + 1,
                "final flush"
            );
            let result = sink.write(&batch).await;
            let failed = result.is_err();
            self.apply_outcome(batch, result);
            self.publish();

            if failed {
                failures += 1;
                if failures < self.config.shutdown_attempts {
                    tokio::time::sleep(self.config.shutdown_retry_delay()).await;
                }
            }
        }

        if !self.buffer.is_empty() {
            let lost = self.buffer.drain_all().len() as u64;
            self.report.lost += lost;
            tracing::error!(lost, attempts = failures, "final flush failed, buffered records lost");
        }
        self.publish();
    }

    async fn release(&mut self) {
        let source = Arc::clone(&self.source);
        if let Err(e) = source.disconnect().await {
            tracing::warn!(error = %e, "broker disconnect failed");
        }
        let sink = Arc::clone(&self.sink);
        if let Err(e) = sink.close().await {
            tracing::warn!(error = %e, "sink close failed");
        }
        self.connection = ConnectionState::Disconnected;
        self.set_state(CoordinatorState::Stopped);

        let r = &self.report;
        tracing::info!(
            observed = r.observed,
            written = r.written,
            write_failures = r.write_failures,
            requeued = r.requeued,
            lost = r.lost,
            "ingestion stopped"
        );
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state == CoordinatorState::Stopped {
            return;
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(CoordinatorStatus {
            state: self.state,
            connection: self.connection,
            subscribing: self.subscribing,
            buffered: self.buffer.len(),
            in_flight: self.in_flight.is_some(),
            observed: self.report.observed,
            written: self.report.written,
            write_failures: self.report.write_failures,
        });
    }
}

/// Issue every configured pattern in order. Failures are logged and do not
/// stop the remaining subscriptions.
async fn subscribe_all(source: Arc<dyn EventSource>, patterns: Vec<String>) {
    let mut acked = 0usize;
    for pattern in patterns.iter().filter(|p| !p.trim().is_empty()) {
        match source.subscribe(pattern).await {
            Ok(()) => {
                acked += 1;
                tracing::info!(pattern = %pattern, "subscribed");
            }
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "subscription failed"),
        }
    }
    if acked == 0 {
        tracing::warn!("no subscription succeeded, nothing will be observed");
    }
}

/// Resolve the slot's future and clear it; pend forever on an empty slot.
async fn settle<T>(slot: &mut Option<Pin<Box<dyn Future<Output = T> + Send>>>) -> T {
    match slot.as_mut() {
        Some(fut) => {
            let out = fut.await;
            *slot = None;
            out
        }
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
