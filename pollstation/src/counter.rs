//! Versioned vote counts for the vote-count long-poll.

use std::collections::BTreeMap;

use tokio::sync::watch;

/// Current ballot counts of all open polls, tagged with a version that
/// increases on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountState {
    pub id: u64,
    pub polls: BTreeMap<i32, u64>,
}

/// Shared count state. Writers are the vote service; readers wait for a
/// strictly newer version.
pub struct VoteCounter {
    tx: watch::Sender<CountState>,
}

impl Default for VoteCounter {
    fn default() -> VoteCounter {
        VoteCounter::new()
    }
}

impl VoteCounter {
    pub fn new() -> VoteCounter {
        let (tx, _) = watch::channel(CountState::default());
        VoteCounter { tx }
    }

    pub fn current(&self) -> CountState {
        self.tx.borrow().clone()
    }

    /// Record the voted count of a poll. Counts are monotonic while a poll
    /// is open, so a stale update from a racing vote is ignored.
    pub fn set(&self, poll_id: i32, count: u64) {
        self.tx.send_modify(|state| {
            let entry = state.polls.entry(poll_id).or_insert(0);
            if count > *entry {
                *entry = count;
                state.id += 1;
            }
        });
    }

    /// Drop a poll from the counts, on stop or clear.
    pub fn remove(&self, poll_id: i32) {
        self.tx.send_modify(|state| {
            if state.polls.remove(&poll_id).is_some() {
                state.id += 1;
            }
        });
    }

    pub fn reset(&self) {
        self.tx.send_modify(|state| {
            if !state.polls.is_empty() {
                state.polls.clear();
                state.id += 1;
            }
        });
    }

    /// Wait until the state is strictly newer than `id` and return it.
    /// Cancellation happens by dropping the future.
    pub async fn wait_newer(&self, id: u64) -> CountState {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let state = rx.borrow();
                if state.id > id {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.tx.borrow().clone();
            }
        }
    }
}
