//! In-memory ballot backend. The main use is testing and single-process
//! deployments without durability requirements.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Backend, BackendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Stopped,
}

#[derive(Debug)]
struct PollRecord {
    phase: Phase,
    voters: HashSet<i32>,
    ballots: Vec<Vec<u8>>,
}

impl PollRecord {
    fn new() -> PollRecord {
        PollRecord {
            phase: Phase::Open,
            voters: HashSet::new(),
            ballots: Vec::new(),
        }
    }
}

/// Ballot backend holding everything in one mutexed map. A missing record
/// is the `absent` state.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    polls: Mutex<HashMap<i32, PollRecord>>,
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn start(&self, poll_id: i32) -> Result<(), BackendError> {
        let mut polls = self.polls.lock().unwrap();
        polls.entry(poll_id).or_insert_with(PollRecord::new);
        Ok(())
    }

    async fn vote(
        &self,
        poll_id: i32,
        user_id: i32,
        object: Vec<u8>,
    ) -> Result<usize, BackendError> {
        let mut polls = self.polls.lock().unwrap();
        let record = polls.get_mut(&poll_id).ok_or(BackendError::DoesNotExist)?;

        if record.phase == Phase::Stopped {
            return Err(BackendError::Stopped);
        }
        if !record.voters.insert(user_id) {
            return Err(BackendError::DoubleVote);
        }
        record.ballots.push(object);
        Ok(record.voters.len())
    }

    async fn stop(&self, poll_id: i32) -> Result<(Vec<Vec<u8>>, Vec<i32>), BackendError> {
        let mut polls = self.polls.lock().unwrap();
        let record = polls.get_mut(&poll_id).ok_or(BackendError::DoesNotExist)?;

        record.phase = Phase::Stopped;

        let mut user_ids: Vec<i32> = record.voters.iter().copied().collect();
        user_ids.sort_unstable();
        Ok((record.ballots.clone(), user_ids))
    }

    async fn clear(&self, poll_id: i32) -> Result<(), BackendError> {
        self.polls.lock().unwrap().remove(&poll_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), BackendError> {
        self.polls.lock().unwrap().clear();
        Ok(())
    }

    async fn voted_polls(
        &self,
        poll_ids: &[i32],
        user_ids: &[i32],
    ) -> Result<HashMap<i32, Vec<i32>>, BackendError> {
        let polls = self.polls.lock().unwrap();
        let mut voted = HashMap::new();
        for &poll_id in poll_ids {
            let users: Vec<i32> = match polls.get(&poll_id) {
                Some(record) => user_ids
                    .iter()
                    .copied()
                    .filter(|user_id| record.voters.contains(user_id))
                    .collect(),
                None => Vec::new(),
            };
            voted.insert(poll_id, users);
        }
        Ok(voted)
    }

    async fn vote_count(&self) -> Result<HashMap<i32, usize>, BackendError> {
        let polls = self.polls.lock().unwrap();
        Ok(polls
            .iter()
            .filter(|(_, record)| record.phase == Phase::Open)
            .map(|(&poll_id, record)| (poll_id, record.voters.len()))
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
