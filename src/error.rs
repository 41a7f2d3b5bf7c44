use crate::action::Role;
use crate::deal::{PartyId, SessionId, Stage};

/// Every way a single inbound event can fail. None of these are fatal to the process.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("No deal is open for session {0}")]
    NoSuchDeal(SessionId),
    #[error("Party {actor} may not act as {role}")]
    Unauthorized { actor: PartyId, role: Role },
    #[error("Action '{action}' is not valid while the deal is {stage}")]
    InvalidTransition { stage: Stage, action: &'static str },
    /// The store could not be reached in time, or the session kept changing until the router
    /// ran out of compare-and-swap retries. Either way nothing was applied that a replay of the
    /// same event would apply twice.
    #[error("Deal storage is unavailable: {0}")]
    StorageUnavailable(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sled backend failure")]
    Backend(#[from] sled::Error),
    #[error("failed to decode stored record")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("stored preference is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("storage task aborted")]
    Join(#[from] tokio::task::JoinError),
    #[error("storage call exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("{0}")]
    Unavailable(String),
}

impl EscrowError {
    /// Only storage failures are worth replaying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EscrowError::StorageUnavailable(_))
    }
}

impl From<StoreError> for EscrowError {
    fn from(value: StoreError) -> Self {
        EscrowError::StorageUnavailable(value.to_string())
    }
}
