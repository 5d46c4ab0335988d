//! Poll configuration as read from the external config store.

/// Which of the two coexisting backend instances stores the poll.
///
/// Routing is purely a deployment choice and does not change semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelector {
    Fast,
    Long,
}

impl Default for BackendSelector {
    fn default() -> Self {
        BackendSelector::Long
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    Named,
    Pseudoanonymous,
    Cryptographic,
    /// Analog polls are tallied outside of this service and are never
    /// started here.
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollMethod {
    Y,
    N,
    YN,
    YNA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Created,
    Started,
    Finished,
    Published,
}

impl Default for PollState {
    fn default() -> Self {
        PollState::Created
    }
}

/// Read-only poll configuration, keyed by poll id in the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub id: i32,
    pub meeting_id: i32,
    #[serde(default)]
    pub backend: BackendSelector,
    pub kind: PollKind,
    pub method: PollMethod,
    #[serde(default)]
    pub entitled_group_ids: Vec<i32>,
    #[serde(default)]
    pub global_yes: bool,
    #[serde(default)]
    pub global_no: bool,
    #[serde(default)]
    pub global_abstain: bool,
    #[serde(default)]
    pub min_amount: i64,
    #[serde(default)]
    pub max_amount: i64,
    #[serde(default)]
    pub max_votes_per_option: i64,
    #[serde(default)]
    pub option_ids: Vec<i32>,
    #[serde(default)]
    pub state: PollState,
}

/// Builds the qualified poll id `<org-hostname>/<id>` that scopes key-store
/// entries across federated deployments.
pub fn qualified_id(organization_url: &str, poll_id: i32) -> Result<String, String> {
    let host = hostname(organization_url)
        .ok_or_else(|| format!("invalid organization url {}", organization_url))?;
    Ok(format!("{}/{}", host, poll_id))
}

fn hostname(url: &str) -> Option<&str> {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let authority = rest.split(|c| c == '/' || c == '?' || c == '#').next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host)
}
