use thiserror::Error;

use crate::{paxos::Slot, NodeIdx};

/// Errors surfaced by the paxos core.
///
/// Stale ballots and preemption are protocol outcomes, not errors; they travel
/// back as reply packets. What remains here are failures the caller must act on.
#[derive(Debug, Error)]
pub enum PaxosError {
    /// The durable log could not record a promise, vote or decision.
    ///
    /// Fatal for this node's participation in the group: nothing that was not
    /// persisted may be acknowledged.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The replicated application refused to execute a decided request.
    #[error("application failed to execute slot {slot} of group {group}: {reason}")]
    Application {
        group: String,
        slot: Slot,
        reason: String,
    },

    #[error("group {0} already exists")]
    GroupExists(String),

    #[error("no such group: {0}")]
    NoSuchGroup(String),

    /// `delete_group` before the group executed its stop request.
    #[error("group {0} has not been stopped")]
    NotStopped(String),

    /// A request arrived after the group executed its stop request.
    #[error("group {0} is stopped")]
    Stopped(String),

    #[error("node {0} is not a member of group {1}")]
    UnknownNode(NodeIdx, String),
}

impl PaxosError {
    /// Whether the error ends this node's participation in the group.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PaxosError::Storage(_) | PaxosError::Io(_) | PaxosError::Application { .. }
        )
    }
}
