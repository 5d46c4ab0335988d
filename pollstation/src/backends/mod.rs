//! Storage backends for poll ballots.
//!
//! Two instances (*fast* and *long*) coexist in one process; each poll
//! routes to one of them via its backend selector. Only the in-memory
//! implementation lives in this crate; network drivers implement the same
//! trait elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

mod memory;

pub use memory::MemoryBackend;

/// Error kinds a backend reports. Callers match on the variant (or use the
/// predicates) instead of parsing strings.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("poll does not exist in the backend")]
    DoesNotExist,

    #[error("user has already voted")]
    DoubleVote,

    #[error("poll is stopped")]
    Stopped,

    #[error("backend failure: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, BackendError::DoesNotExist)
    }

    pub fn is_double_vote(&self) -> bool {
        matches!(self, BackendError::DoubleVote)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, BackendError::Stopped)
    }
}

/// Per-poll state machine with durable ballot storage.
///
/// State transitions: `absent → open` on `start`, `open → closed` on `stop`,
/// anything `→ absent` on `clear`. `start` on a closed poll is a noop so a
/// stopped poll cannot be resurrected; the legitimate re-open path is
/// `clear` followed by `start`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens the poll for votes. Starting an open poll is ok; starting a
    /// stopped poll is a noop that keeps the stopped state.
    async fn start(&self, poll_id: i32) -> Result<(), BackendError>;

    /// Appends a ballot. The backend checks that the poll is open and the
    /// user has not voted before. Returns the number of voted users.
    async fn vote(&self, poll_id: i32, user_id: i32, object: Vec<u8>)
        -> Result<usize, BackendError>;

    /// Closes the poll and returns all ballots in insertion order together
    /// with the sorted ids of all users that voted. Stopping a stopped poll
    /// returns the same data.
    ///
    /// At the instant `stop` returns, no later `vote` against the same poll
    /// can succeed. A vote racing the stop either appears in the returned
    /// list or fails with `Stopped`, never both.
    async fn stop(&self, poll_id: i32) -> Result<(Vec<Vec<u8>>, Vec<i32>), BackendError>;

    /// Removes all data of the poll. Valid in every state.
    async fn clear(&self, poll_id: i32) -> Result<(), BackendError>;

    /// Removes all data of all polls.
    async fn clear_all(&self) -> Result<(), BackendError>;

    /// For each requested poll, the subset of the given users that have a
    /// ballot recorded. Unknown polls yield an empty set.
    async fn voted_polls(
        &self,
        poll_ids: &[i32],
        user_ids: &[i32],
    ) -> Result<HashMap<i32, Vec<i32>>, BackendError>;

    /// Current number of ballots per open poll.
    async fn vote_count(&self) -> Result<HashMap<i32, usize>, BackendError>;

    fn name(&self) -> &'static str;
}
