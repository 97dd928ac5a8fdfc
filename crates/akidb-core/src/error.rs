use thiserror::Error;

use crate::ids::{NodeId, SegmentId};
use crate::segment::SegmentKey;

/// Canonical error type for data coordination operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No segment is open for allocation on the key. Callers open a new
    /// segment and retry.
    #[error("no growing segment for {key}")]
    NoGrowingSegment {
        /// Allocation key that has no target.
        key: SegmentKey,
    },

    /// Another segment is already the allocation target for the key and still
    /// has spare capacity.
    #[error("segment `{segment_id}` is already open for {key}")]
    SegmentAlreadyOpen {
        /// Segment currently serving the key.
        segment_id: SegmentId,
        /// Allocation key.
        key: SegmentKey,
    },

    /// A worker node could not be reached or no node is available.
    #[error("node unavailable: {message}")]
    NodeUnavailable {
        /// Node involved, when a specific one is known.
        node_id: Option<NodeId>,
        /// Human-readable explanation.
        message: String,
    },

    /// Entity was not found in the metadata store.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"segment"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"segment"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// The metadata store rejected or could not serve the request.
    #[error("metadata store unavailable: {0}")]
    MetaUnavailable(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a `NodeUnavailable` variant.
    #[must_use]
    pub fn node_unavailable(node_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self::NodeUnavailable {
            node_id,
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller is expected to open a segment and retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoGrowingSegment { .. } | Self::SegmentAlreadyOpen { .. }
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() || err.is_data() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
