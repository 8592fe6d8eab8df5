use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tracker_api::SourceError;

pub(crate) type Reply = oneshot::Sender<Result<(), SourceError>>;

pub(crate) struct Pending {
    pub pattern: String,
    pub reply: Reply,
}

/// Subscribe requests waiting for their SUBACK.
///
/// The client API does not return packet ids, so requests are queued in
/// send order and bound to the id the event loop reports for the next
/// outgoing SUBSCRIBE.
///
/// Requests abandoned before their SUBSCRIBE went out stay queued inside
/// the client and are sent after the next reconnect, ahead of anything
/// issued later. `orphaned` counts them so their packet ids are skipped
/// instead of being bound to a newer caller.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    unassigned: VecDeque<Pending>,
    awaiting: HashMap<u16, Pending>,
    orphaned: usize,
}

impl SubscriptionTable {
    pub fn push(&mut self, pattern: String, reply: Reply) {
        self.unassigned.push_back(Pending { pattern, reply });
    }

    /// Undo the last `push` when the request never reached the event loop.
    pub fn pop_last(&mut self) -> Option<Pending> {
        self.unassigned.pop_back()
    }

    pub fn assign(&mut self, pkid: u16) -> bool {
        if self.orphaned > 0 {
            self.orphaned -= 1;
            return false;
        }
        match self.unassigned.pop_front() {
            Some(pending) => {
                self.awaiting.insert(pkid, pending);
                true
            }
            None => false,
        }
    }

    pub fn take(&mut self, pkid: u16) -> Option<Pending> {
        self.awaiting.remove(&pkid)
    }

    /// Everything still outstanding, oldest request first. Unassigned
    /// requests become orphaned.
    pub fn drain(&mut self) -> Vec<Pending> {
        self.orphaned += self.unassigned.len();
        let mut awaiting: Vec<_> = self.awaiting.drain().collect();
        awaiting.sort_by_key(|(pkid, _)| *pkid);
        awaiting
            .into_iter()
            .map(|(_, p)| p)
            .chain(self.unassigned.drain(..))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.unassigned.is_empty() && self.awaiting.is_empty()
    }
}
