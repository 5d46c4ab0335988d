use thiserror::Error;

/// Error kinds surfaced to callers of the vote service.
///
/// Every variant is a distinct, inspectable kind; the HTTP layer maps them to
/// a wire representation via [`VoteError::kind`]. `NotAllowed` carries the
/// denied rule for logging but never shows it to the caller.
#[derive(Debug, Error)]
pub enum VoteError {
    /// Malformed input, a non-startable poll type, an exceeded capacity or a
    /// ballot that failed format validation. The reason is user visible.
    #[error("{0}")]
    Invalid(String),

    /// A presence, group or delegation rule denied the vote.
    #[error("Not allowed to vote")]
    NotAllowed(String),

    /// The poll is unknown to the addressed component.
    #[error("Poll does not exist")]
    NotExists,

    /// The vote user already has a ballot for this poll.
    #[error("User has already voted")]
    DoubleVote,

    /// The poll is in the closed state.
    #[error("Poll is stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VoteError {
    /// Record the denied rule in the log and return the collapsed error.
    pub fn not_allowed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::info!("vote not allowed: {}", reason);
        VoteError::NotAllowed(reason)
    }

    /// Stable identifier for the wire representation.
    pub fn kind(&self) -> &'static str {
        match self {
            VoteError::Invalid(_) => "invalid",
            VoteError::NotAllowed(_) => "not-allowed",
            VoteError::NotExists => "not-exists",
            VoteError::DoubleVote => "double-vote",
            VoteError::Stopped => "stopped",
            VoteError::Internal(_) => "internal",
        }
    }
}
