/// Why a flush was requested. Ordered by strength: a timer or shutdown
/// flush works through the whole buffer one batch at a time, a size flush
/// only fires when a full batch is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Drain up to one batch and start a write now.
    Flush,
    /// A write is in flight; remember the trigger for when it settles.
    Defer,
    /// Nothing to do.
    Idle,
}

/// Decides when the buffer is drained. Holds no state besides the
/// threshold; the caller tracks whether a write is in flight and whether
/// a failed batch is waiting for its retry.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    batch_size: usize,
}

impl FlushPolicy {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `retry_pending` is set while requeued records wait for the next
    /// timer tick. Size triggers are ignored meanwhile, so an outage does
    /// not turn every new record into another write attempt.
    pub fn decide(&self, trigger: FlushTrigger, buffered: usize, in_flight: bool, retry_pending: bool) -> FlushDecision {
        if buffered == 0 {
            return FlushDecision::Idle;
        }
        if trigger == FlushTrigger::Size && (retry_pending || buffered < self.batch_size) {
            return FlushDecision::Idle;
        }
        if in_flight {
            FlushDecision::Defer
        } else {
            FlushDecision::Flush
        }
    }

    /// Re-evaluate once the in-flight write resolved.
    ///
    /// After a success the buffer is re-checked (deferred trigger, or size).
    /// After a failure the requeued records wait for the next fresh trigger.
    pub fn after_settle(&self, succeeded: bool, deferred: Option<FlushTrigger>, buffered: usize) -> FlushDecision {
        if !succeeded {
            return FlushDecision::Idle;
        }
        self.decide(deferred.unwrap_or(FlushTrigger::Size), buffered, false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_trigger_waits_for_full_batch() {
        let policy = FlushPolicy::new(3);
        assert_eq!(policy.decide(FlushTrigger::Size, 2, false, false), FlushDecision::Idle);
        assert_eq!(policy.decide(FlushTrigger::Size, 3, false, false), FlushDecision::Flush);
        assert_eq!(policy.decide(FlushTrigger::Size, 3, true, false), FlushDecision::Defer);
    }

    #[test]
    fn pending_retry_holds_size_flushes_until_timer() {
        let policy = FlushPolicy::new(2);
        assert_eq!(policy.decide(FlushTrigger::Size, 10, false, true), FlushDecision::Idle);
        assert_eq!(policy.decide(FlushTrigger::Timer, 10, false, true), FlushDecision::Flush);
        assert_eq!(policy.decide(FlushTrigger::Shutdown, 10, false, true), FlushDecision::Flush);
    }

    #[test]
    fn timer_flushes_any_amount_and_ignores_empty_buffer() {
        let policy = FlushPolicy::new(100);
        assert_eq!(policy.decide(FlushTrigger::Timer, 1, false, false), FlushDecision::Flush);
        assert_eq!(policy.decide(FlushTrigger::Timer, 0, false, false), FlushDecision::Idle);
        assert_eq!(policy.decide(FlushTrigger::Shutdown, 0, false, false), FlushDecision::Idle);
        assert_eq!(policy.decide(FlushTrigger::Timer, 5, true, false), FlushDecision::Defer);
    }

    #[test]
    fn deferred_trigger_replays_only_after_success() {
        let policy = FlushPolicy::new(10);
        assert_eq!(policy.after_settle(true, Some(FlushTrigger::Timer), 2), FlushDecision::Flush);
        assert_eq!(policy.after_settle(true, None, 2), FlushDecision::Idle);
        assert_eq!(policy.after_settle(true, None, 12), FlushDecision::Flush);
        assert_eq!(policy.after_settle(false, Some(FlushTrigger::Timer), 12), FlushDecision::Idle);
    }

    #[test]
    fn stronger_trigger_wins_when_merged() {
        assert_eq!(FlushTrigger::Size.max(FlushTrigger::Timer), FlushTrigger::Timer);
        assert_eq!(FlushTrigger::Shutdown.max(FlushTrigger::Timer), FlushTrigger::Shutdown);
    }
}
