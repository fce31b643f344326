//! Error taxonomy for the join protocol and membership tracking.

use thiserror::Error;

use crate::types::{MembershipEvent, NodeState};

/// Join token validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("unknown token")]
    Unknown,

    #[error("token expired")]
    Expired,

    #[error("token already consumed")]
    AlreadyConsumed,
}

/// Join failures surfaced to the requesting node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// Address is not a valid host:port pair
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Another node already holds this address
    #[error("address {0} already belongs to a cluster member")]
    AlreadyMember(String),

    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    /// The join could not be completed in time
    #[error("join timed out")]
    Timeout,

    /// Membership bookkeeping refused the new node
    #[error("internal error: {0}")]
    Internal(#[from] InvalidTransition),
}

impl JoinError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Internal(_) => 500,
            _ => 403,
        }
    }

    /// Stable machine-readable code, distinct per failure cause
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "invalid_address",
            Self::AlreadyMember(_) => "already_member",
            Self::Token(TokenError::Unknown) => "token_unknown",
            Self::Token(TokenError::Expired) => "token_expired",
            Self::Token(TokenError::AlreadyConsumed) => "token_consumed",
            Self::Timeout => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true if a retry needs a freshly issued token
    pub fn needs_new_token(&self) -> bool {
        matches!(self, Self::Token(_))
    }

    /// Returns true if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Channel registration failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The node is neither awaiting confirmation nor reconnectable
    #[error("node is {state}, not joining")]
    NotJoining { state: NodeState },

    #[error("unknown node")]
    UnknownNode,
}

/// A state machine transition that is not in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event} from {from}")]
pub struct InvalidTransition {
    pub from: NodeState,
    pub event: MembershipEvent,
}
