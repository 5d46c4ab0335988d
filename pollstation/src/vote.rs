//! The vote service: composes backends, config snapshots, the counter and
//! the decrypt engine behind the operations the HTTP layer consumes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use base64ct::{Base64, Encoding};
use serde_json::value::RawValue;
use tracing::debug;

use crate::backends::{Backend, BackendError};
use crate::ballot::{self, BallotPayload, CipherEnvelope, VoteEnvelope};
use crate::config::{ConfigSource, PollSnapshot};
use crate::counter::{CountState, VoteCounter};
use crate::decrypt::{DecryptError, Decrypter};
use crate::error::VoteError;
use crate::poll::{self, BackendSelector, PollConfig, PollKind, PollState};

/// Public key material of a cryptographic poll, returned from start.
#[derive(Debug, Clone, Serialize)]
pub struct PollKey {
    #[serde(with = "crate::serde_base64")]
    pub public_key: Vec<u8>,
    #[serde(rename = "public_key_sig", with = "crate::serde_base64")]
    pub signature: Vec<u8>,
}

/// Unified result of stopping a poll.
///
/// For plaintext polls `votes` is the JSON array of stored ballot envelopes.
/// For cryptographic polls it is the signed artifact from the decrypt engine
/// and `invalid` maps artifact indexes to validation failures.
#[derive(Debug, Serialize)]
pub struct StopResult {
    pub votes: Box<RawValue>,
    #[serde(with = "crate::serde_base64::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    pub user_ids: Vec<i32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub invalid: BTreeMap<usize, String>,
}

/// State of the vote service. Has to be initialized with [`VoteService::new`].
pub struct VoteService {
    fast_backend: Box<dyn Backend>,
    long_backend: Box<dyn Backend>,
    config: Arc<dyn ConfigSource>,
    decrypter: Option<Arc<dyn Decrypter>>,
    counter: VoteCounter,
    snapshots: RwLock<HashMap<i32, Arc<PollSnapshot>>>,
}

impl VoteService {
    pub fn new(
        fast_backend: Box<dyn Backend>,
        long_backend: Box<dyn Backend>,
        config: Arc<dyn ConfigSource>,
        decrypter: Option<Arc<dyn Decrypter>>,
    ) -> VoteService {
        VoteService {
            fast_backend,
            long_backend,
            config,
            decrypter,
            counter: VoteCounter::new(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn backend(&self, poll: &PollConfig) -> &dyn Backend {
        let backend = match poll.backend {
            BackendSelector::Fast => self.fast_backend.as_ref(),
            BackendSelector::Long => self.long_backend.as_ref(),
        };
        debug!("used backend: {}", backend.name());
        backend
    }

    async fn load_poll(&self, poll_id: i32) -> Result<PollConfig, VoteError> {
        self.config
            .poll(poll_id)
            .await
            .map_err(internal)?
            .ok_or(VoteError::NotExists)
    }

    async fn qualified_id(&self, poll_id: i32) -> Result<String, VoteError> {
        let url = self.config.organization_url().await.map_err(internal)?;
        poll::qualified_id(&url, poll_id).map_err(VoteError::Internal)
    }

    /// Snapshot of the poll's config data. Filled by `start`; rebuilt once
    /// if this process has not seen the poll yet.
    async fn snapshot(&self, poll_id: i32) -> Result<Arc<PollSnapshot>, VoteError> {
        if let Some(snapshot) = self.snapshots.read().unwrap().get(&poll_id) {
            return Ok(snapshot.clone());
        }

        let poll = self.load_poll(poll_id).await?;
        let snapshot = Arc::new(
            PollSnapshot::load(self.config.as_ref(), poll)
                .await
                .map_err(internal)?,
        );
        self.snapshots
            .write()
            .unwrap()
            .insert(poll_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Start an electronic vote.
    ///
    /// Idempotent: repeated calls with the same poll return the same result,
    /// also after the poll was stopped. For cryptographic polls the signed
    /// public poll key is returned.
    pub async fn start(&self, poll_id: i32) -> Result<Option<PollKey>, VoteError> {
        debug!("receive start event for poll {}", poll_id);

        let poll = self.load_poll(poll_id).await?;
        if poll.kind == PollKind::Analog {
            return Err(VoteError::Invalid(
                "Analog poll can not be started".to_string(),
            ));
        }

        let snapshot = Arc::new(
            PollSnapshot::load(self.config.as_ref(), poll.clone())
                .await
                .map_err(|err| internal(format!("preloading data: {}", err)))?,
        );
        self.snapshots.write().unwrap().insert(poll_id, snapshot);

        let backend = self.backend(&poll);
        backend
            .start(poll_id)
            .await
            .map_err(|err| internal(format!("starting poll in the backend: {}", err)))?;

        if poll.kind != PollKind::Cryptographic {
            return Ok(None);
        }

        // An opened poll without key material must not leak out.
        match self.start_decrypter(poll_id).await {
            Ok(poll_key) => Ok(Some(poll_key)),
            Err(err) => {
                let _ = backend.clear(poll_id).await;
                Err(err)
            }
        }
    }

    async fn start_decrypter(&self, poll_id: i32) -> Result<PollKey, VoteError> {
        let decrypter = self
            .decrypter
            .as_ref()
            .ok_or_else(|| internal("no decrypt engine configured"))?;
        let qid = self.qualified_id(poll_id).await?;
        let (public_key, signature) = decrypter
            .start(&qid)
            .await
            .map_err(|err| internal(format!("starting poll in decrypter: {}", err)))?;
        Ok(PollKey {
            public_key,
            signature,
        })
    }

    /// Validate and save a ballot.
    pub async fn vote(
        &self,
        poll_id: i32,
        request_user: i32,
        body: &[u8],
    ) -> Result<(), VoteError> {
        debug!(
            "receive vote event for poll {} from user {}",
            poll_id, request_user
        );

        let snapshot = self.snapshot(poll_id).await?;
        let poll = &snapshot.poll;

        if poll.state != PollState::Started {
            return Err(VoteError::Invalid("Poll is not started".to_string()));
        }
        if poll.kind == PollKind::Analog {
            return Err(VoteError::Invalid(
                "Analog polls do not support votes".to_string(),
            ));
        }

        if !snapshot.is_present(request_user) {
            return Err(VoteError::not_allowed(format!(
                "user {} is not present in meeting {}",
                request_user, poll.meeting_id
            )));
        }

        let payload: BallotPayload = serde_json::from_slice(body)
            .map_err(|err| VoteError::Invalid(format!("decoding payload: {}", err)))?;

        let vote_user = payload.user_id.unwrap_or(request_user);
        if vote_user == 0 {
            return Err(VoteError::not_allowed(
                "votes for anonymous users are not allowed",
            ));
        }

        let user = snapshot.user(vote_user).ok_or_else(|| {
            VoteError::not_allowed(format!("user {} is not covered by the poll", vote_user))
        })?;

        if !user
            .group_ids
            .iter()
            .any(|group_id| poll.entitled_group_ids.contains(group_id))
        {
            return Err(VoteError::not_allowed(format!(
                "user {} is not in a group that is allowed to vote",
                vote_user
            )));
        }

        if vote_user != request_user {
            if !snapshot.meeting.enable_vote_delegations {
                return Err(VoteError::not_allowed(format!(
                    "vote delegation is not activated in meeting {}",
                    poll.meeting_id
                )));
            }
            if user.vote_delegated_to != Some(request_user) {
                return Err(VoteError::not_allowed(format!(
                    "user {} can not vote for user {}",
                    request_user, vote_user
                )));
            }
        }

        let object = if poll.kind == PollKind::Cryptographic {
            let encoded = payload.value.as_global().ok_or_else(|| {
                VoteError::Invalid("cryptographic ballot has to be a base64 string".to_string())
            })?;
            let value = Base64::decode_vec(encoded).map_err(|_| {
                VoteError::Invalid("cryptographic ballot is not valid base64".to_string())
            })?;
            serde_json::to_vec(&CipherEnvelope { value }).map_err(internal)?
        } else {
            if let Some(reason) = ballot::validate(poll, &payload.value) {
                return Err(VoteError::Invalid(reason));
            }

            let weight = snapshot.weight_of(vote_user);
            debug!("using vote weight {}", weight);

            let (request_user_id, vote_user_id) = if poll.kind == PollKind::Named {
                (request_user, vote_user)
            } else {
                (0, 0)
            };
            serde_json::to_vec(&VoteEnvelope {
                request_user_id,
                vote_user_id,
                value: payload.value,
                weight,
            })
            .map_err(internal)?
        };

        let voted_count = self
            .backend(poll)
            .vote(poll_id, vote_user, object)
            .await
            .map_err(|err| match err {
                BackendError::DoesNotExist => VoteError::NotExists,
                BackendError::DoubleVote => VoteError::DoubleVote,
                BackendError::Stopped => VoteError::Stopped,
                other => internal(format!("save vote: {}", other)),
            })?;

        self.counter.set(poll_id, voted_count as u64);
        Ok(())
    }

    /// End a poll.
    ///
    /// Idempotent: repeated calls return the same data until the poll is
    /// cleared.
    pub async fn stop(&self, poll_id: i32) -> Result<StopResult, VoteError> {
        debug!("receive stop event for poll {}", poll_id);

        let poll = self.load_poll(poll_id).await?;
        let backend = self.backend(&poll);

        let (ballots, user_ids) = backend.stop(poll_id).await.map_err(|err| {
            if err.is_does_not_exist() {
                VoteError::NotExists
            } else {
                internal(format!("fetching vote objects: {}", err))
            }
        })?;
        self.counter.remove(poll_id);

        match poll.kind {
            PollKind::Cryptographic => self.stop_crypto(&poll, ballots, user_ids).await,
            _ => stop_plain(ballots, user_ids),
        }
    }

    async fn stop_crypto(
        &self,
        poll: &PollConfig,
        ballots: Vec<Vec<u8>>,
        user_ids: Vec<i32>,
    ) -> Result<StopResult, VoteError> {
        let decrypter = self
            .decrypter
            .as_ref()
            .ok_or_else(|| internal("no decrypt engine configured"))?;
        let qid = self.qualified_id(poll.id).await?;

        let mut vote_list = Vec::with_capacity(ballots.len());
        for stored in &ballots {
            let envelope: CipherEnvelope = serde_json::from_slice(stored)
                .map_err(|err| internal(format!("decoding stored vote: {}", err)))?;
            vote_list.push(envelope.value);
        }

        let (content, signature) =
            decrypter
                .stop(&qid, vote_list)
                .await
                .map_err(|err| match err {
                    DecryptError::NotExist => VoteError::NotExists,
                    DecryptError::Invalid(reason) => VoteError::Invalid(reason),
                    DecryptError::Internal(reason) => {
                        internal(format!("decrypting votes: {}", reason))
                    }
                })?;

        let decrypted: DecryptedContent = serde_json::from_slice(&content)
            .map_err(|err| internal(format!("decoding decrypted votes: {}", err)))?;

        let mut invalid = BTreeMap::new();
        for (index, vote) in decrypted.votes.iter().enumerate() {
            match &vote.votes {
                Some(value) => {
                    if let Some(reason) = ballot::validate(poll, value) {
                        invalid.insert(index, reason);
                    }
                }
                None => {
                    invalid.insert(index, "Your vote has a wrong format".to_string());
                }
            }
        }

        let votes = String::from_utf8(content)
            .ok()
            .and_then(|content| RawValue::from_string(content).ok())
            .ok_or_else(|| internal("decrypted content is not valid JSON"))?;

        Ok(StopResult {
            votes,
            signature: Some(signature),
            user_ids,
            invalid,
        })
    }

    /// Remove all knowledge of a poll. Both backends, the snapshot and the
    /// decrypt engine are cleared even if one of them fails.
    pub async fn clear(&self, poll_id: i32) -> Result<(), VoteError> {
        debug!("receive clear event for poll {}", poll_id);

        let mut result = Ok(());

        if let Err(err) = self.fast_backend.clear(poll_id).await {
            result = Err(internal(format!("clearing fast backend: {}", err)));
        }
        if let Err(err) = self.long_backend.clear(poll_id).await {
            if result.is_ok() {
                result = Err(internal(format!("clearing long backend: {}", err)));
            }
        }

        self.snapshots.write().unwrap().remove(&poll_id);
        self.counter.remove(poll_id);

        if let Some(decrypter) = &self.decrypter {
            let cleared = match self.qualified_id(poll_id).await {
                Ok(qid) => decrypter
                    .clear(&qid)
                    .await
                    .map_err(|err| internal(format!("clearing decrypter: {}", err))),
                Err(err) => Err(err),
            };
            if let Err(err) = cleared {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Remove all polls from both backends and reset the config cache.
    pub async fn clear_all(&self) -> Result<(), VoteError> {
        debug!("receive clear all event");

        self.config.reset_cache();

        self.fast_backend
            .clear_all()
            .await
            .map_err(|err| internal(format!("clearing fast backend: {}", err)))?;
        self.long_backend
            .clear_all()
            .await
            .map_err(|err| internal(format!("clearing long backend: {}", err)))?;

        self.snapshots.write().unwrap().clear();
        self.counter.reset();
        Ok(())
    }

    /// For each requested poll, the users from the request user's delegation
    /// circle that have already voted. Unknown polls yield an empty list.
    pub async fn voted_polls(
        &self,
        poll_ids: &[i32],
        request_user: i32,
    ) -> Result<BTreeMap<i32, Vec<i32>>, VoteError> {
        debug!(
            "receive voted event for polls {:?} from user {}",
            poll_ids, request_user
        );

        let mut user_ids = vec![request_user];
        user_ids.extend(
            self.config
                .delegations_from(request_user)
                .await
                .map_err(internal)?,
        );

        let mut fast_ids = Vec::new();
        let mut long_ids = Vec::new();
        for &poll_id in poll_ids {
            // polls unknown to the config store are skipped, not errors
            let poll = match self.config.poll(poll_id).await.map_err(internal)? {
                Some(poll) => poll,
                None => continue,
            };
            match poll.backend {
                BackendSelector::Fast => fast_ids.push(poll_id),
                BackendSelector::Long => long_ids.push(poll_id),
            }
        }

        let mut result = BTreeMap::new();
        if !fast_ids.is_empty() {
            let voted = self
                .fast_backend
                .voted_polls(&fast_ids, &user_ids)
                .await
                .map_err(|err| internal(format!("voted polls from fast backend: {}", err)))?;
            result.extend(voted);
        }
        if !long_ids.is_empty() {
            let voted = self
                .long_backend
                .voted_polls(&long_ids, &user_ids)
                .await
                .map_err(|err| internal(format!("voted polls from long backend: {}", err)))?;
            result.extend(voted);
        }

        for &poll_id in poll_ids {
            result.entry(poll_id).or_default();
        }
        Ok(result)
    }

    /// Current ballot counts over both backends.
    ///
    /// With `blocking` the call waits until the state is strictly newer than
    /// `id`; cancellation happens by dropping the future (the HTTP layer
    /// wraps it in its long-poll timeout).
    pub async fn vote_count(&self, id: u64, blocking: bool) -> Result<CountState, VoteError> {
        if blocking {
            let current = self.counter.current();
            if current.id > id {
                return Ok(current);
            }
            return Ok(self.counter.wait_newer(id).await);
        }

        let mut polls = BTreeMap::new();
        for backend in [self.fast_backend.as_ref(), self.long_backend.as_ref()] {
            let counts = backend
                .vote_count()
                .await
                .map_err(|err| internal(format!("count from {}: {}", backend.name(), err)))?;
            for (poll_id, count) in counts {
                if count > 0 {
                    polls.insert(poll_id, count as u64);
                }
            }
        }
        Ok(CountState {
            id: self.counter.current().id,
            polls,
        })
    }
}

fn stop_plain(ballots: Vec<Vec<u8>>, user_ids: Vec<i32>) -> Result<StopResult, VoteError> {
    let mut votes = Vec::with_capacity(ballots.len());
    for stored in ballots {
        let vote = String::from_utf8(stored)
            .ok()
            .and_then(|stored| RawValue::from_string(stored).ok())
            .ok_or_else(|| internal("stored ballot is not valid JSON"))?;
        votes.push(vote);
    }

    Ok(StopResult {
        votes: serde_json::value::to_raw_value(&votes).map_err(internal)?,
        signature: None,
        user_ids,
        invalid: BTreeMap::new(),
    })
}

#[derive(Deserialize)]
struct DecryptedContent {
    #[serde(default)]
    votes: Vec<DecryptedBallot>,
}

#[derive(Deserialize)]
struct DecryptedBallot {
    #[serde(default)]
    votes: Option<crate::ballot::BallotValue>,
}

fn internal(err: impl std::fmt::Display) -> VoteError {
    VoteError::Internal(err.to_string())
}
