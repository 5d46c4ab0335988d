//! Read-only access to the external configuration store and the per-poll
//! preload snapshot the vote path is served from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::poll::PollConfig;

/// Default vote weight, a decimal field with six places.
pub const DEFAULT_WEIGHT: &str = "1.000000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fetching config data: {0}")]
    Fetch(String),
}

/// Meeting level flags the vote path needs.
#[derive(Debug, Clone, Default)]
pub struct MeetingConfig {
    pub id: i32,
    pub enable_vote_weight: bool,
    pub enable_vote_delegations: bool,
}

/// Per-user configuration, scoped to one meeting where a field is
/// meeting-dependent.
#[derive(Debug, Clone, Default)]
pub struct UserConfig {
    pub id: i32,
    /// Groups of the user in the meeting.
    pub group_ids: Vec<i32>,
    /// Meetings the user is currently present in.
    pub present_in_meetings: Vec<i32>,
    /// The user the vote is delegated to in the meeting, if any.
    pub vote_delegated_to: Option<i32>,
    /// Vote weight in the meeting; falls back to the default weight.
    pub vote_weight: Option<String>,
    pub default_vote_weight: Option<String>,
}

/// Boundary to the external configuration store.
///
/// The concrete implementation is expected to fetch over the network and to
/// batch: `users` must resolve all requested ids in one round trip. All vote
/// path lookups go through a [`PollSnapshot`] instead of this trait.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Url of the organization, used to build qualified poll ids.
    async fn organization_url(&self) -> Result<String, ConfigError>;

    /// Poll configuration, `None` for an unknown poll.
    async fn poll(&self, poll_id: i32) -> Result<Option<PollConfig>, ConfigError>;

    async fn meeting(&self, meeting_id: i32) -> Result<MeetingConfig, ConfigError>;

    async fn group_member_ids(&self, group_id: i32) -> Result<Vec<i32>, ConfigError>;

    /// Bulk fetch of user records for one meeting.
    async fn users(&self, meeting_id: i32, user_ids: &[i32]) -> Result<Vec<UserConfig>, ConfigError>;

    /// All users that delegated their vote to the given user, across
    /// meetings. Used to answer "has this user or any of their delegators
    /// voted?".
    async fn delegations_from(&self, user_id: i32) -> Result<Vec<i32>, ConfigError>;

    /// Drop any internal cache. A no-op for sources without one.
    fn reset_cache(&self) {}
}

/// Immutable snapshot of everything a poll's vote path can need.
///
/// Built once on poll start with bulk fetches; after that the vote path
/// issues zero requests to the config store. A vote naming a user outside
/// the snapshot is denied.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub poll: PollConfig,
    pub meeting: MeetingConfig,
    users: HashMap<i32, UserConfig>,
}

impl PollSnapshot {
    pub async fn load(
        source: &dyn ConfigSource,
        poll: PollConfig,
    ) -> Result<PollSnapshot, ConfigError> {
        let meeting = source.meeting(poll.meeting_id).await?;

        let mut member_ids: Vec<i32> = Vec::new();
        for group_id in &poll.entitled_group_ids {
            for user_id in source.group_member_ids(*group_id).await? {
                if !member_ids.contains(&user_id) {
                    member_ids.push(user_id);
                }
            }
        }

        let mut users: HashMap<i32, UserConfig> = source
            .users(poll.meeting_id, &member_ids)
            .await?
            .into_iter()
            .map(|user| (user.id, user))
            .collect();

        // Delegatees outside the entitled groups may still receive votes.
        let delegatee_ids: Vec<i32> = {
            let mut ids: Vec<i32> = users
                .values()
                .filter_map(|user| user.vote_delegated_to)
                .filter(|id| !users.contains_key(id))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        if !delegatee_ids.is_empty() {
            for user in source.users(poll.meeting_id, &delegatee_ids).await? {
                users.insert(user.id, user);
            }
        }

        Ok(PollSnapshot {
            poll,
            meeting,
            users,
        })
    }

    pub fn user(&self, user_id: i32) -> Option<&UserConfig> {
        self.users.get(&user_id)
    }

    pub fn is_present(&self, user_id: i32) -> bool {
        self.user(user_id)
            .map(|user| user.present_in_meetings.contains(&self.poll.meeting_id))
            .unwrap_or(false)
    }

    /// Weight of the user's ballot: the meeting weight if set, else the
    /// default weight, else `1.000000`. Always `1.000000` when the meeting
    /// has vote weight disabled.
    pub fn weight_of(&self, user_id: i32) -> String {
        if !self.meeting.enable_vote_weight {
            return DEFAULT_WEIGHT.to_string();
        }
        let user = match self.user(user_id) {
            Some(user) => user,
            None => return DEFAULT_WEIGHT.to_string(),
        };
        user.vote_weight
            .as_ref()
            .filter(|weight| !weight.is_empty())
            .or(user
                .default_vote_weight
                .as_ref()
                .filter(|weight| !weight.is_empty()))
            .cloned()
            .unwrap_or_else(|| DEFAULT_WEIGHT.to_string())
    }
}

/// In-memory config source for tests and development setups.
///
/// Counts every trait call so tests can assert the vote path stays off the
/// config store.
#[derive(Default)]
pub struct MemoryConfig {
    data: RwLock<ConfigData>,
    requests: AtomicUsize,
}

#[derive(Default)]
struct ConfigData {
    organization_url: String,
    polls: HashMap<i32, PollConfig>,
    meetings: HashMap<i32, MeetingConfig>,
    groups: HashMap<i32, Vec<i32>>,
    users: HashMap<(i32, i32), UserConfig>,
    delegations_from: HashMap<i32, Vec<i32>>,
}

impl MemoryConfig {
    pub fn new(organization_url: impl Into<String>) -> MemoryConfig {
        let config = MemoryConfig::default();
        config.data.write().unwrap().organization_url = organization_url.into();
        config
    }

    pub fn add_poll(&self, poll: PollConfig) {
        self.data.write().unwrap().polls.insert(poll.id, poll);
    }

    pub fn add_meeting(&self, meeting: MeetingConfig) {
        self.data
            .write()
            .unwrap()
            .meetings
            .insert(meeting.id, meeting);
    }

    pub fn set_group(&self, group_id: i32, member_ids: Vec<i32>) {
        self.data.write().unwrap().groups.insert(group_id, member_ids);
    }

    pub fn add_user(&self, meeting_id: i32, user: UserConfig) {
        self.data
            .write()
            .unwrap()
            .users
            .insert((meeting_id, user.id), user);
    }

    pub fn set_delegations_from(&self, user_id: i32, delegator_ids: Vec<i32>) {
        self.data
            .write()
            .unwrap()
            .delegations_from
            .insert(user_id, delegator_ids);
    }

    /// Number of requests issued against this source so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigSource for MemoryConfig {
    async fn organization_url(&self) -> Result<String, ConfigError> {
        self.count();
        Ok(self.data.read().unwrap().organization_url.clone())
    }

    async fn poll(&self, poll_id: i32) -> Result<Option<PollConfig>, ConfigError> {
        self.count();
        Ok(self.data.read().unwrap().polls.get(&poll_id).cloned())
    }

    async fn meeting(&self, meeting_id: i32) -> Result<MeetingConfig, ConfigError> {
        self.count();
        Ok(self
            .data
            .read()
            .unwrap()
            .meetings
            .get(&meeting_id)
            .cloned()
            .unwrap_or(MeetingConfig {
                id: meeting_id,
                ..MeetingConfig::default()
            }))
    }

    async fn group_member_ids(&self, group_id: i32) -> Result<Vec<i32>, ConfigError> {
        self.count();
        Ok(self
            .data
            .read()
            .unwrap()
            .groups
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn users(&self, meeting_id: i32, user_ids: &[i32]) -> Result<Vec<UserConfig>, ConfigError> {
        self.count();
        let data = self.data.read().unwrap();
        Ok(user_ids
            .iter()
            .map(|&user_id| {
                data.users
                    .get(&(meeting_id, user_id))
                    .cloned()
                    .unwrap_or(UserConfig {
                        id: user_id,
                        ..UserConfig::default()
                    })
            })
            .collect())
    }

    async fn delegations_from(&self, user_id: i32) -> Result<Vec<i32>, ConfigError> {
        self.count();
        Ok(self
            .data
            .read()
            .unwrap()
            .delegations_from
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}
