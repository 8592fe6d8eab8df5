use std::collections::VecDeque;

use tracker_api::TopicObservation;

/// Pending observations waiting for the next flush.
///
/// Never rejects a record: if the sink stays down the buffer keeps growing.
/// Growth is made visible instead of capped: a warning is logged each time
/// the size crosses a doubling high-water mark.
#[derive(Debug)]
pub struct BatchBuffer {
    records: VecDeque<TopicObservation>,
    warn_base: usize,
    next_warn: usize,
}

impl BatchBuffer {
    pub fn new(warn_threshold: usize) -> Self {
        let warn_base = warn_threshold.max(1);
        Self {
            records: VecDeque::new(),
            warn_base,
            next_warn: warn_base,
        }
    }

    pub fn append(&mut self, record: TopicObservation) {
        self.records.push_back(record);
        self.check_growth();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take everything, in append order.
    pub fn drain_all(&mut self) -> Vec<TopicObservation> {
        self.records.drain(..).collect()
    }

    /// Take the oldest `max` records, in append order.
    pub fn drain_batch(&mut self, max: usize) -> Vec<TopicObservation> {
        let take = max.min(self.records.len());
        self.records.drain(..take).collect()
    }

    /// Put a failed batch back in front of whatever arrived since it was
    /// drained.
    pub fn prepend(&mut self, batch: Vec<TopicObservation>) {
        if batch.is_empty() {
            return;
        }
        let mut merged: VecDeque<_> = batch.into();
        merged.append(&mut self.records);
        self.records = merged;
        self.check_growth();
    }

    /// Next size at which a growth warning fires.
    pub fn high_water_mark(&self) -> usize {
        self.next_warn
    }

    /// Re-arm the growth warning once a successful write brought the
    /// buffer back under the first threshold. Draining and requeueing
    /// alone never lower the mark.
    pub fn rearm_warning(&mut self) {
        if self.records.len() < self.warn_base {
            self.next_warn = self.warn_base;
        }
    }

    fn check_growth(&mut self) {
        if self.records.len() < self.next_warn {
            return;
        }
        tracing::warn!(
            buffered = self.records.len(),
            "ingest buffer keeps growing, sink is not keeping up (no cap is applied)"
        );
        while self.next_warn <= self.records.len() {
            self.next_warn = self.next_warn.saturating_mul(2);
        }
    }
}
