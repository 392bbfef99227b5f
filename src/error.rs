//! Error types for the coordination core
//!
//! Taxonomy covering store access, slot claiming, epoch consistency,
//! and peer transport failures.

use thiserror::Error;

use crate::store::StoreError;

/// Primary error type for all coordination operations
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Coordination store lost quorum or is otherwise unreachable
    #[error("coordination store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Job layout already exists in the store
    #[error("job {job} is already running")]
    JobAlreadyRunning { job: String },

    /// Every task slot of the job is claimed by another node
    #[error("no free task slot in job {job}")]
    SlotTaken { job: String },

    /// A data exchange carried a different epoch than the local one
    #[error("epoch mismatch: local {local}, remote {remote}")]
    EpochMismatch { local: u64, remote: u64 },

    /// A neighbor could not be reached at its advertised address
    #[error("peer task {task_id} unreachable: {reason}")]
    PeerUnreachable { task_id: u64, reason: String },

    /// The job prefix disappeared from the store
    #[error("job terminated")]
    JobTerminated,

    /// The neighbor-data listener could not be bound
    #[error("listener bind on {addr} failed: {reason}")]
    ListenerBind { addr: String, reason: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CascadeError {
    /// Returns true if the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CascadeError::StoreUnavailable { .. } | CascadeError::PeerUnreachable { .. }
        )
    }
}

impl From<StoreError> for CascadeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { message } => CascadeError::StoreUnavailable { message },
            other => CascadeError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CascadeError>;
