//! Achieve consensus on a sequence of requests per group using Multi-Paxos.

pub mod acceptor;
pub mod coordinator;
pub mod dir;
pub mod instance;
pub mod manager;
pub mod storage;

use std::{cmp::Ordering, fmt::Display};

use serde_derive::{Deserialize, Serialize};

use crate::{NodeIdx, PaxosError};

/// A position in a group's replicated log.
pub type Slot = u64;

/// Identifier of a replicated group (one paxos instance per node).
pub type GroupId = String;

/// Error type the application returns from [`Replicable`] callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Leadership epoch. Ordered by number, then by coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub num: u64,
    pub coordinator: NodeIdx,
}

impl Ballot {
    pub fn new(num: u64, coordinator: NodeIdx) -> Ballot {
        Ballot { num, coordinator }
    }

    /// The ballot every member starts with: number 0, led by the first member.
    pub fn initial(members: &[NodeIdx]) -> Ballot {
        Ballot::new(0, members.first().copied().unwrap_or_default())
    }

    /// Smallest ballot above `highest` that belongs to `members[position]`.
    ///
    /// Ballot numbers of one member are congruent to its position modulo the
    /// group size, so two contenders never produce the same number.
    pub fn next_for(highest: Ballot, position: usize, members: &[NodeIdx]) -> Ballot {
        let n = members.len().max(1) as u64;
        let num = highest.num + 1;
        let num = num + (position as u64 + n - num % n) % n;
        Ballot::new(num, members.get(position).copied().unwrap_or_default())
    }

    pub fn compare(&self, other: &Ballot) -> Ordering {
        self.cmp(other)
    }

    pub fn higher_than(&self, other: &Ballot) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.num, self.coordinator)
    }
}

/// A client request as it travels through the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestPacket {
    /// Client-chosen, for de-duplication on the client side.
    pub request_id: u64,
    pub client: u64,
    pub value: Vec<u8>,
    /// Hole filler chosen by a coordinator; never executed by the application.
    #[serde(default)]
    pub noop: bool,
    /// Final request of a group; once executed the group accepts nothing more.
    #[serde(default)]
    pub stop: bool,
}

impl RequestPacket {
    pub fn new(request_id: u64, client: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            client,
            value: value.into(),
            noop: false,
            stop: false,
        }
    }

    pub fn noop() -> Self {
        Self {
            request_id: 0,
            client: 0,
            value: vec![],
            noop: true,
            stop: false,
        }
    }

    pub fn stop(request_id: u64, client: u64) -> Self {
        Self {
            stop: true,
            ..Self::new(request_id, client, vec![])
        }
    }
}

/// A request tentatively bound to a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalPacket {
    pub slot: Slot,
    pub request: RequestPacket,
}

/// `(slot, ballot, request)`: the unit of agreement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PValue {
    pub slot: Slot,
    pub ballot: Ballot,
    pub request: RequestPacket,
}

impl PValue {
    pub fn new(slot: Slot, ballot: Ballot, request: RequestPacket) -> Self {
        Self {
            slot,
            ballot,
            request,
        }
    }

    pub fn proposal(&self) -> ProposalPacket {
        ProposalPacket {
            slot: self.slot,
            request: self.request.clone(),
        }
    }
}

/// A pvalue accepted by a majority. Final for its slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub pvalue: PValue,
    /// Highest slot known executed at a majority. Only drives log truncation.
    pub majority_committed_slot: Option<Slot>,
}

impl Decision {
    pub fn slot(&self) -> Slot {
        self.pvalue.slot
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareReply {
    pub acceptor: NodeIdx,
    /// The prepared ballot if accepted, otherwise the higher promised one.
    pub ballot: Ballot,
    pub accepted: bool,
    /// Every pvalue the acceptor accepted at or above `next_to_execute`.
    pub pvalues: Vec<PValue>,
    pub next_to_execute: Slot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptReply {
    pub acceptor: NodeIdx,
    pub slot: Slot,
    /// The accepted ballot, or the higher promised one on rejection.
    pub ballot: Ballot,
    pub accepted: bool,
    pub next_to_execute: Slot,
}

/// Every message of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaxosMessage {
    // client <-> any member
    Request(RequestPacket),
    // resigned coordinator -> new coordinator
    Proposal(ProposalPacket),
    Preempted(PValue),

    // coordinator <-> acceptor
    Prepare {
        ballot: Ballot,
        members: Vec<NodeIdx>,
    },
    PrepareReply(PrepareReply),
    Accept(PValue),
    AcceptReply(AcceptReply),
    Decision(Decision),

    // lagging member <-> peer
    SyncRequest {
        missing: Vec<Slot>,
        next_to_execute: Slot,
    },
    Checkpoint {
        next_to_execute: Slot,
        state: Vec<u8>,
        /// The state already includes the group's stop request.
        #[serde(default)]
        stopped: bool,
    },
}

impl PaxosMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PaxosMessage::Request(_) => "REQUEST",
            PaxosMessage::Proposal(_) => "PROPOSAL",
            PaxosMessage::Preempted(_) => "PREEMPTED",
            PaxosMessage::Prepare { .. } => "PREPARE",
            PaxosMessage::PrepareReply(_) => "PREPARE_REPLY",
            PaxosMessage::Accept(_) => "ACCEPT",
            PaxosMessage::AcceptReply(_) => "ACCEPT_REPLY",
            PaxosMessage::Decision(_) => "DECISION",
            PaxosMessage::SyncRequest { .. } => "SYNC_REQUEST",
            PaxosMessage::Checkpoint { .. } => "CHECKPOINT",
        }
    }
}

/// One message on the wire: the group it belongs to and who sent it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaxosPacket {
    pub group: GroupId,
    pub sender: NodeIdx,
    pub message: PaxosMessage,
}

impl PaxosPacket {
    pub fn encode(&self) -> Result<Vec<u8>, PaxosError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PaxosError> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// A message an instance wants delivered; the manager does the sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: NodeIdx,
    pub message: PaxosMessage,
}

/// The replicated application (e.g. the name-record store).
pub trait Replicable: Send + Sync {
    /// Execute a decided request. Called at most once per slot, in slot order,
    /// never for no-ops nor for anything decided after a stop request.
    fn apply_decision(&self, group: &str, slot: Slot, request: &RequestPacket)
        -> Result<(), BoxError>;

    /// Serialized state of the group, for checkpoints.
    fn get_state(&self, group: &str) -> Option<Vec<u8>>;

    /// Replace the group's state with a checkpoint.
    fn put_state(&self, group: &str, state: &[u8]) -> Result<(), BoxError>;
}

/// Point-to-point send primitive of the transport. Best effort: may drop.
pub trait Messenger: Send + Sync {
    fn send(&self, to: NodeIdx, packet: &PaxosPacket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballots_order_by_number_then_coordinator() {
        let a = Ballot::new(1, 2);
        let b = Ballot::new(1, 3);
        let c = Ballot::new(2, 0);

        assert_eq!(a.compare(&b), Ordering::Less);
        assert!(c.higher_than(&b));
        assert!(!a.higher_than(&a));
        assert_eq!(a, Ballot::new(1, 2));
    }

    #[test]
    fn next_ballot_is_owned_by_position() {
        let members = [10, 11, 12];
        let b = Ballot::next_for(Ballot::new(0, 10), 1, &members);
        assert_eq!(b, Ballot::new(1, 11));

        let b = Ballot::next_for(Ballot::new(1, 11), 1, &members);
        assert_eq!(b, Ballot::new(4, 11));

        let b = Ballot::next_for(Ballot::new(4, 11), 0, &members);
        assert_eq!(b, Ballot::new(6, 10));
    }

    #[test]
    fn initial_ballot_led_by_first_member() {
        assert_eq!(Ballot::initial(&[4, 7, 9]), Ballot::new(0, 4));
        assert_eq!(Ballot::new(3, 1).to_string(), "3:1");
    }

    #[test]
    fn decision_packet_survives_the_wire() {
        let packet = PaxosPacket {
            group: "names".into(),
            sender: 2,
            message: PaxosMessage::Decision(Decision {
                pvalue: PValue::new(5, Ballot::new(1, 2), RequestPacket::new(9, 1, "put a=1")),
                majority_committed_slot: Some(3),
            }),
        };
        let buf = packet.encode().expect("encode");
        let text = String::from_utf8(buf.clone()).expect("utf8");
        assert!(text.contains("\"type\":\"DECISION\""));
        assert_eq!(PaxosPacket::decode(&buf).expect("decode"), packet);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            PaxosPacket::decode(b"{\"group\":"),
            Err(PaxosError::Codec(_))
        ));
    }

    #[test]
    fn noop_and_stop_constructors() {
        assert!(RequestPacket::noop().noop);
        let stop = RequestPacket::stop(1, 2);
        assert!(stop.stop && !stop.noop);
    }
}
