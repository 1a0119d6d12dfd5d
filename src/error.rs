//! Registry error taxonomy.
//!
//! Every layer above the bucket database reports failures as a
//! [`RegistryError`]. The enum is serializable and carries a stable integer
//! code so a follower can rebuild the exact kind from a forwarding response.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the registry.
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Errors surfaced by registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryError {
    /// Caller supplied a malformed or missing argument.
    #[error("invalid param: {reason}")]
    InvalidParam { reason: String },

    /// A node, user, group, resource, or bucket does not exist.
    #[error("not found: {reason}")]
    NotFound { reason: String },

    /// A node NS, user, or group with the same name already exists.
    #[error("already exists: {reason}")]
    AlreadyExists { reason: String },

    /// The operation is forbidden for the target's current shape.
    #[error("not allowed: {reason}")]
    NotAllowed { reason: String },

    /// A replicated write was attempted on a follower.
    #[error("node is not the leader")]
    NotLeader,

    /// The consensus log did not commit within the apply timeout.
    #[error("consensus apply timed out")]
    ConsensusTimeout,

    /// Disk, transaction, or consensus failure.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// Follower to leader forwarding failed (no leader, dial, decode).
    #[error("forwarding error: {reason}")]
    Forwarding { reason: String },

    /// Resource bytes or a stored JSON document are corrupt.
    #[error("invalid format: {reason}")]
    InvalidFormat { reason: String },

    /// A resource id is not a valid UUID.
    #[error("invalid uuid: {reason}")]
    InvalidUuid { reason: String },
}

impl RegistryError {
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam { reason: reason.into() }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound { reason: reason.into() }
    }

    pub fn already_exists(reason: impl Into<String>) -> Self {
        Self::AlreadyExists { reason: reason.into() }
    }

    pub fn not_allowed(reason: impl Into<String>) -> Self {
        Self::NotAllowed { reason: reason.into() }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage { reason: reason.into() }
    }

    pub fn forwarding(reason: impl Into<String>) -> Self {
        Self::Forwarding { reason: reason.into() }
    }

    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat { reason: reason.into() }
    }

    /// Stable wire code. Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParam { .. } => 1,
            Self::NotFound { .. } => 2,
            Self::AlreadyExists { .. } => 3,
            Self::NotAllowed { .. } => 4,
            Self::NotLeader => 5,
            Self::ConsensusTimeout => 6,
            Self::Storage { .. } => 7,
            Self::Forwarding { .. } => 8,
            Self::InvalidFormat { .. } => 9,
            Self::InvalidUuid { .. } => 10,
        }
    }

    /// The variable part of the error, sent as `message` on the forwarding wire.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidParam { reason }
            | Self::NotFound { reason }
            | Self::AlreadyExists { reason }
            | Self::NotAllowed { reason }
            | Self::Storage { reason }
            | Self::Forwarding { reason }
            | Self::InvalidFormat { reason }
            | Self::InvalidUuid { reason } => reason.clone(),
            Self::NotLeader | Self::ConsensusTimeout => String::new(),
        }
    }

    /// Rebuilds an error from a forwarding response. Returns `None` for code 0.
    pub fn from_code(code: i32, message: impl Into<String>) -> Option<Self> {
        let reason = message.into();
        let err = match code {
            0 => return None,
            1 => Self::InvalidParam { reason },
            2 => Self::NotFound { reason },
            3 => Self::AlreadyExists { reason },
            4 => Self::NotAllowed { reason },
            5 => Self::NotLeader,
            6 => Self::ConsensusTimeout,
            7 => Self::Storage { reason },
            8 => Self::Forwarding { reason },
            9 => Self::InvalidFormat { reason },
            10 => Self::InvalidUuid { reason },
            other => Self::Forwarding {
                reason: format!("unknown error code {other}: {reason}"),
            },
        };
        Some(err)
    }

    /// HTTP status the external API layer reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidParam { .. } | Self::InvalidUuid { .. } => 400,
            Self::NotAllowed { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::Storage { .. } | Self::InvalidFormat { .. } => 500,
            Self::Forwarding { .. } => 502,
            Self::NotLeader => 503,
            Self::ConsensusTimeout => 504,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<uuid::Error> for RegistryError {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidUuid { reason: err.to_string() }
    }
}

impl From<regex::Error> for RegistryError {
    fn from(err: regex::Error) -> Self {
        Self::InvalidParam {
            reason: format!("invalid machine regex: {err}"),
        }
    }
}

/// Response envelope of the HTTP API: `{httpstatus, data}`.
///
/// `data` holds the payload on success and the error string on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub httpstatus: u16,
    pub data: serde_json::Value,
}

impl ApiResponse {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self { httpstatus: 200, data },
            Err(err) => Self::error(&RegistryError::invalid_format(err.to_string())),
        }
    }

    pub fn error(err: &RegistryError) -> Self {
        Self {
            httpstatus: err.http_status(),
            data: serde_json::Value::String(err.to_string()),
        }
    }

    pub fn from_result<T: Serialize>(result: &Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::error(err),
        }
    }
}
