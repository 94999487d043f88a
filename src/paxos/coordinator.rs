use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use itertools::Itertools;
use tracing::{debug, info};

use super::{AcceptReply, Ballot, Decision, GroupId, PValue, PaxosMessage, PrepareReply, RequestPacket, Slot};
use crate::{NodeIdx, PaxosConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Preparing,
    Active,
}

/// One in-flight phase-2 round.
#[derive(Debug)]
struct Commander {
    pvalue: PValue,
    acks: HashSet<NodeIdx>,
    sent_at: Instant,
}

/// Leader state for one ballot. Dropped on resignation.
#[derive(Debug)]
pub struct CoordinatorState {
    ballot: Ballot,
    status: CoordinatorStatus,
    members: Vec<NodeIdx>,
    next_proposal_slot: Slot,

    prepare_replies: HashMap<NodeIdx, PrepareReply>,
    prepare_sent_at: Instant,
    commanders: BTreeMap<Slot, Commander>,
    /// Requests that arrived before activation.
    queued: VecDeque<RequestPacket>,
    /// Last `next_to_execute` reported by each acceptor.
    executed: HashMap<NodeIdx, Slot>,
}

impl CoordinatorState {
    fn new(ballot: Ballot, members: &[NodeIdx], now: Instant) -> Self {
        Self {
            ballot,
            status: CoordinatorStatus::Preparing,
            members: members.to_vec(),
            next_proposal_slot: 0,
            prepare_replies: HashMap::new(),
            prepare_sent_at: now,
            commanders: BTreeMap::new(),
            queued: VecDeque::new(),
            executed: HashMap::new(),
        }
    }

    fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn prepare_message(&self) -> PaxosMessage {
        PaxosMessage::Prepare {
            ballot: self.ballot,
            members: self.members.clone(),
        }
    }

    fn spawn(&mut self, slot: Slot, request: RequestPacket, now: Instant) -> PValue {
        let pvalue = PValue::new(slot, self.ballot, request);
        self.commanders.insert(
            slot,
            Commander {
                pvalue: pvalue.clone(),
                acks: HashSet::new(),
                sent_at: now,
            },
        );
        pvalue
    }

    fn next_pvalue(&mut self, request: RequestPacket, now: Instant) -> PValue {
        let slot = self.next_proposal_slot;
        self.next_proposal_slot += 1;
        self.spawn(slot, request, now)
    }

    /// Highest slot executed at a majority of members, as far as we know.
    fn majority_committed_slot(&self) -> Option<Slot> {
        let watermarks = self
            .members
            .iter()
            .map(|m| self.executed.get(m).copied().unwrap_or(0))
            .sorted()
            .collect::<Vec<_>>();
        let index = watermarks.len().checked_sub(self.majority())?;
        watermarks[index].checked_sub(1)
    }

    fn record_executed(&mut self, acceptor: NodeIdx, next_to_execute: Slot) {
        let known = self.executed.entry(acceptor).or_insert(next_to_execute);
        *known = (*known).max(next_to_execute);
    }

    /// Requests that still need a home: queued ones, then undecided proposals.
    fn pending(self) -> Vec<RequestPacket> {
        self.queued
            .into_iter()
            .chain(self.commanders.into_values().map(|c| c.pvalue.request))
            .filter(|r| !r.noop)
            .collect()
    }

    /// Phase-1 merge: highest ballot wins per slot, holes become no-ops.
    fn activate(&mut self, now: Instant) -> Vec<PValue> {
        let low = self
            .prepare_replies
            .values()
            .map(|r| r.next_to_execute)
            .max()
            .unwrap_or(0);
        let merged: BTreeMap<Slot, RequestPacket> = self
            .prepare_replies
            .values()
            .flat_map(|r| r.pvalues.iter())
            .filter(|p| p.slot >= low)
            .into_group_map_by(|p| p.slot)
            .into_iter()
            .filter_map(|(slot, votes)| {
                votes
                    .into_iter()
                    .max_by_key(|p| p.ballot)
                    .map(|p| (slot, p.request.clone()))
            })
            .collect();

        let high = merged.keys().next_back().map_or(low, |s| (s + 1).max(low));
        let mut accepts = Vec::new();
        let mut holes = 0;
        for slot in low..high {
            let request = match merged.get(&slot) {
                Some(r) => r.clone(),
                None => {
                    holes += 1;
                    RequestPacket::noop()
                }
            };
            accepts.push(self.spawn(slot, request, now));
        }
        self.next_proposal_slot = high;
        self.status = CoordinatorStatus::Active;

        while let Some(request) = self.queued.pop_front() {
            let pvalue = self.next_pvalue(request, now);
            accepts.push(pvalue);
        }
        debug!(ballot = %self.ballot, low, high, holes, "merged prepare replies");
        accepts
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    Ignored,
    /// A majority promised; these ACCEPTs must go to every member.
    Activated(Vec<PValue>),
    /// Someone holds a higher ballot. We resigned.
    Preempted {
        ballot: Ballot,
        pending: Vec<RequestPacket>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Ignored,
    Committed(Decision),
    /// `pvalue` lost to `ballot` and should be forwarded to its coordinator.
    /// `resigned` is set once nothing is left outstanding.
    Preempted {
        ballot: Ballot,
        pvalue: PValue,
        resigned: Option<Vec<RequestPacket>>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProposeOutcome {
    Accept(PValue),
    Queued,
    NotCoordinator(RequestPacket),
}

/// Coordinator role of one paxos instance: nonexistent, preparing or active.
pub struct Coordinator {
    group: GroupId,
    state: Option<CoordinatorState>,
    max_outstanding: u64,
    accept_timeout: Duration,
    prepare_timeout: Duration,
}

impl Coordinator {
    pub fn new(group: GroupId, config: &PaxosConfig) -> Self {
        Self {
            group,
            state: None,
            max_outstanding: config.max_outstanding,
            accept_timeout: config.accept_timeout(),
            prepare_timeout: config.prepare_timeout(),
        }
    }

    pub fn exists(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(CoordinatorStatus::Active)
    }

    pub fn status(&self) -> Option<CoordinatorStatus> {
        self.state.as_ref().map(|s| s.status)
    }

    pub fn ballot(&self) -> Option<Ballot> {
        self.state.as_ref().map(|s| s.ballot)
    }

    pub fn outstanding(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.commanders.len())
    }

    /// Takes the coordinator role for `ballot`.
    ///
    /// Ballot number 0 is the bootstrap ballot: it is active at once and
    /// proposes from `start_slot`. Every other ballot returns the PREPARE to
    /// broadcast. An equal ballot that is still preparing re-sends it.
    pub fn make_coordinator(
        &mut self,
        ballot: Ballot,
        members: &[NodeIdx],
        start_slot: Slot,
        now: Instant,
    ) -> Option<PaxosMessage> {
        match &mut self.state {
            Some(state) if ballot == state.ballot => {
                if state.status == CoordinatorStatus::Preparing {
                    state.prepare_sent_at = now;
                    return Some(state.prepare_message());
                }
                return None;
            }
            Some(state) if ballot < state.ballot => return None,
            _ => {}
        }

        let mut state = CoordinatorState::new(ballot, members, now);
        if ballot.num == 0 {
            state.status = CoordinatorStatus::Active;
            state.next_proposal_slot = start_slot;
            info!(group = %self.group, %ballot, start_slot, "bootstrap coordinator active");
            self.state = Some(state);
            return None;
        }
        info!(group = %self.group, %ballot, "preparing");
        let prepare = state.prepare_message();
        self.state = Some(state);
        Some(prepare)
    }

    /// The PREPARE of the current round, if still preparing.
    pub fn prepare(&mut self, now: Instant) -> Option<PaxosMessage> {
        let state = self.state.as_mut()?;
        if state.status != CoordinatorStatus::Preparing {
            return None;
        }
        state.prepare_sent_at = now;
        Some(state.prepare_message())
    }

    pub fn handle_prepare_reply(&mut self, reply: PrepareReply, now: Instant) -> PrepareOutcome {
        let Some(state) = self.state.as_mut() else {
            return PrepareOutcome::Ignored;
        };
        if reply.ballot > state.ballot {
            let ballot = reply.ballot;
            let pending = self.resign();
            info!(group = %self.group, %ballot, "preempted while preparing");
            return PrepareOutcome::Preempted { ballot, pending };
        }
        if !reply.accepted || reply.ballot != state.ballot || state.status == CoordinatorStatus::Active {
            return PrepareOutcome::Ignored;
        }

        state.record_executed(reply.acceptor, reply.next_to_execute);
        state.prepare_replies.insert(reply.acceptor, reply);
        if state.prepare_replies.len() < state.majority() {
            return PrepareOutcome::Ignored;
        }

        let accepts = state.activate(now);
        info!(group = %self.group, ballot = %state.ballot, next_slot = state.next_proposal_slot, "coordinator active");
        PrepareOutcome::Activated(accepts)
    }

    pub fn propose(&mut self, request: RequestPacket, now: Instant) -> ProposeOutcome {
        let Some(state) = self.state.as_mut() else {
            return ProposeOutcome::NotCoordinator(request);
        };
        match state.status {
            CoordinatorStatus::Preparing => {
                state.queued.push_back(request);
                ProposeOutcome::Queued
            }
            CoordinatorStatus::Active => ProposeOutcome::Accept(state.next_pvalue(request, now)),
        }
    }

    pub fn handle_accept_reply(&mut self, reply: AcceptReply) -> AcceptOutcome {
        let Some(state) = self.state.as_mut() else {
            return AcceptOutcome::Ignored;
        };
        state.record_executed(reply.acceptor, reply.next_to_execute);

        if reply.ballot > state.ballot {
            let Some(commander) = state.commanders.remove(&reply.slot) else {
                return AcceptOutcome::Ignored;
            };
            debug!(group = %self.group, slot = reply.slot, ballot = %reply.ballot, "commander preempted");
            let resigned = state.commanders.is_empty().then(|| self.resign());
            if resigned.is_some() {
                info!(group = %self.group, ballot = %reply.ballot, "every commander preempted, resigning");
            }
            return AcceptOutcome::Preempted {
                ballot: reply.ballot,
                pvalue: commander.pvalue,
                resigned,
            };
        }
        if !reply.accepted || reply.ballot != state.ballot {
            return AcceptOutcome::Ignored;
        }

        let majority = state.majority();
        let Some(commander) = state.commanders.get_mut(&reply.slot) else {
            return AcceptOutcome::Ignored;
        };
        commander.acks.insert(reply.acceptor);
        if commander.acks.len() < majority {
            return AcceptOutcome::Ignored;
        }

        let pvalue = match state.commanders.remove(&reply.slot) {
            Some(commander) => commander.pvalue,
            None => return AcceptOutcome::Ignored,
        };
        AcceptOutcome::Committed(Decision {
            pvalue,
            majority_committed_slot: state.majority_committed_slot(),
        })
    }

    /// Whether the pipeline ran `max_outstanding` slots ahead of `acceptor_slot`.
    pub fn is_overloaded(&self, acceptor_slot: Slot) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.next_proposal_slot >= acceptor_slot + self.max_outstanding)
    }

    pub fn waiting_too_long(&self, now: Instant) -> bool {
        self.state.as_ref().is_some_and(|s| {
            s.commanders
                .values()
                .any(|c| now.saturating_duration_since(c.sent_at) >= self.accept_timeout)
        })
    }

    /// ACCEPTs of every commander older than the accept timeout.
    pub fn re_commander(&mut self, now: Instant) -> Vec<PValue> {
        let Some(state) = self.state.as_mut() else {
            return vec![];
        };
        let timeout = self.accept_timeout;
        state
            .commanders
            .values_mut()
            .filter(|c| now.saturating_duration_since(c.sent_at) >= timeout)
            .map(|c| {
                c.sent_at = now;
                c.pvalue.clone()
            })
            .collect()
    }

    /// The PREPARE again if phase 1 is stuck past the prepare timeout.
    pub fn re_prepare(&mut self, now: Instant) -> Option<PaxosMessage> {
        let stalled = self.state.as_ref().is_some_and(|s| {
            s.status == CoordinatorStatus::Preparing
                && now.saturating_duration_since(s.prepare_sent_at) >= self.prepare_timeout
        });
        if stalled {
            self.prepare(now)
        } else {
            None
        }
    }

    /// Drops the role, handing back requests that were never decided.
    pub fn resign(&mut self) -> Vec<RequestPacket> {
        match self.state.take() {
            Some(state) => {
                debug!(group = %self.group, ballot = %state.ballot, "resigning");
                state.pending()
            }
            None => vec![],
        }
    }
}
