use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use tracker_api::{SinkError, SinkWriter, TopicObservation, WriteFailure, WriteReport};

// ═══════════════════════════════════════════════════════════════
//  MemorySink
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Ledger {
    attempts: Vec<Vec<TopicObservation>>,
    committed: Vec<Vec<TopicObservation>>,
    script: VecDeque<WriteFailure>,
    init_failure: Option<String>,
}

/// In-memory sink. Keeps every batch it was handed and every batch it
/// accepted, and can be scripted to fail upcoming writes.
///
/// A scripted partial failure with rejected positions commits the other
/// records, the way a bulk API would.
#[derive(Default)]
pub struct MemorySink {
    ledger: Mutex<Ledger>,
    delay: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
    init_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write takes `delay` before it resolves.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next unscripted write with `failure`. Calls queue up.
    pub async fn fail_next(&self, failure: WriteFailure) {
        self.ledger.lock().await.script.push_back(failure);
    }

    /// Make `init` fail with a remote error.
    pub async fn fail_init(&self, message: impl Into<String>) {
        self.ledger.lock().await.init_failure = Some(message.into());
    }

    /// Batches handed to `write`, in call order, including failed ones.
    pub async fn attempts(&self) -> Vec<Vec<TopicObservation>> {
        self.ledger.lock().await.attempts.clone()
    }

    /// Batches (or their accepted part) that were stored.
    pub async fn committed(&self) -> Vec<Vec<TopicObservation>> {
        self.ledger.lock().await.committed.clone()
    }

    /// Stored records, flattened in write order.
    pub async fn records(&self) -> Vec<TopicObservation> {
        self.ledger.lock().await.committed.iter().flatten().cloned().collect()
    }

    /// Highest number of writes that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SinkWriter for MemorySink {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            match &self.ledger.lock().await.init_failure {
                Some(message) => Err(SinkError::remote(message.clone())),
                None => Ok(()),
            }
        })
    }

    fn write<'a>(
        &'a self,
        batch: &'a [TopicObservation],
    ) -> Pin<Box<dyn Future<Output = Result<WriteReport, WriteFailure>> + Send + 'a>> {
        Box::pin(async move {
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let outcome = {
                let mut ledger = self.ledger.lock().await;
                ledger.attempts.push(batch.to_vec());
                match ledger.script.pop_front() {
                    None => {
                        ledger.committed.push(batch.to_vec());
                        Ok(WriteReport { written: batch.len() })
                    }
                    Some(failure) => {
                        if let Some(rejected) = &failure.rejected {
                            let accepted: Vec<_> = batch
                                .iter()
                                .enumerate()
                                .filter(|(pos, _)| !rejected.contains(pos))
                                .map(|(_, record)| record.clone())
                                .collect();
                            if !accepted.is_empty() {
                                ledger.committed.push(accepted);
                            }
                        }
                        Err(failure)
                    }
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
