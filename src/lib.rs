//! Multi-Paxos replication core for a distributed name service.
//!
//! Every replicated record group runs its own paxos instance: an acceptor that
//! durably votes on proposals, and, while this node leads the group, a
//! coordinator that orders requests into slots. A [`paxos::manager::PaxosManager`]
//! owns all instances of a node and routes packets to them by group id.

use std::{fmt::Display, fs, path::Path, time::Duration};

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod paxos;

pub use error::PaxosError;

/// Compact integer handle for a node, used everywhere inside the consensus core.
///
/// The mapping to the transport's [`NodeId`] lives in [`paxos::dir::NodeMap`].
pub type NodeIdx = u32;

/// Opaque transport-level node identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub id: [u8; 16], // Uuid.
}

impl NodeId {
    pub fn random() -> Self {
        Self {
            id: *Uuid::new_v4().as_bytes(),
        }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.id))
    }
}

/// Tunables for every paxos instance on a node.
///
/// Missing fields take their [`Default`] values when loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaxosConfig {
    /// How many slots a coordinator may run ahead of its own acceptor.
    pub max_outstanding: u64,
    /// A phase-2 round older than this is re-sent.
    pub accept_timeout_ms: u64,
    /// A phase-1 round older than this is re-sent.
    pub prepare_timeout_ms: u64,
    /// Minimum gap between two catch-up requests from one instance.
    pub sync_timeout_ms: u64,
    /// Executed slots between two local checkpoints.
    pub checkpoint_interval: u64,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 128,
            accept_timeout_ms: 1_000,
            prepare_timeout_ms: 1_000,
            sync_timeout_ms: 500,
            checkpoint_interval: 400,
        }
    }
}

impl PaxosConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PaxosError> {
        let buf = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&buf)?)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
