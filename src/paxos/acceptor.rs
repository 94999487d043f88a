use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};

use super::{
    storage::{GroupLog, PaxosStorage},
    AcceptReply, Ballot, Decision, GroupId, PValue, PrepareReply, Slot,
};
use crate::{NodeIdx, PaxosError};

/// Acceptor half of a paxos instance.
///
/// Everything it promises or accepts is persisted before the reply is built.
pub struct AcceptorState {
    group: GroupId,
    /// This is us.
    id: NodeIdx,
    storage: Arc<dyn PaxosStorage>,

    /// Highest ballot promised. Never decreases.
    ballot: Ballot,
    /// Accepted, not yet decided.
    accepted: BTreeMap<Slot, PValue>,
    /// Decided and not yet garbage collected: executed ones below
    /// `next_to_execute`, buffered ones at or above it.
    decisions: BTreeMap<Slot, Decision>,
    /// First slot not executed yet.
    next_to_execute: Slot,
    /// Every slot at or below this was dropped from the log.
    gc_slot: Option<Slot>,
}

impl AcceptorState {
    pub fn new(group: GroupId, id: NodeIdx, members: &[NodeIdx], storage: Arc<dyn PaxosStorage>) -> Self {
        Self {
            group,
            id,
            storage,
            ballot: Ballot::initial(members),
            accepted: BTreeMap::new(),
            decisions: BTreeMap::new(),
            next_to_execute: 0,
            gc_slot: None,
        }
    }

    /// Rebuilds the acceptor from its durable log.
    ///
    /// Decisions past the checkpoint are left buffered; the owner replays them
    /// with [`AcceptorState::execute_ready`] once the checkpoint is restored.
    pub fn recover(group: GroupId, id: NodeIdx, log: &GroupLog, storage: Arc<dyn PaxosStorage>) -> Self {
        let next_to_execute = log.checkpoint.as_ref().map_or(0, |c| c.next_to_execute);
        let ballot = log
            .accepted
            .values()
            .map(|p| p.ballot)
            .chain(log.decisions.values().map(|d| d.pvalue.ballot))
            .chain(log.promised)
            .fold(Ballot::initial(&log.members), Ballot::max);

        Self {
            group,
            id,
            storage,
            ballot,
            accepted: log
                .accepted
                .range(next_to_execute..)
                .map(|(s, p)| (*s, p.clone()))
                .collect(),
            decisions: log.decisions.clone(),
            next_to_execute,
            gc_slot: log.gc_slot,
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn next_to_execute(&self) -> Slot {
        self.next_to_execute
    }

    /// Highest slot executed, if any.
    pub fn committed_up_to(&self) -> Option<Slot> {
        self.next_to_execute.checked_sub(1)
    }

    pub fn gc_slot(&self) -> Option<Slot> {
        self.gc_slot
    }

    pub fn decision(&self, slot: Slot) -> Option<&Decision> {
        self.decisions.get(&slot)
    }

    pub fn accepted(&self, slot: Slot) -> Option<&PValue> {
        self.accepted.get(&slot)
    }

    /// Highest slot this acceptor has any record of.
    pub fn highest_slot(&self) -> Option<Slot> {
        let accepted = self.accepted.keys().next_back().copied();
        let decided = self.decisions.keys().next_back().copied();
        accepted.max(decided)
    }

    /// Slots below the highest buffered decision that have no decision yet.
    pub fn missing_slots(&self) -> Vec<Slot> {
        match self.decisions.keys().next_back() {
            Some(&last) if last > self.next_to_execute => (self.next_to_execute..last)
                .filter(|s| !self.decisions.contains_key(s))
                .collect(),
            _ => vec![],
        }
    }

    fn promise(&mut self, ballot: Ballot) -> Result<(), PaxosError> {
        if ballot > self.ballot {
            self.storage.put_promise(&self.group, ballot)?;
            self.ballot = ballot;
        }
        Ok(())
    }

    /// Phase 1b.
    pub fn handle_prepare(&mut self, ballot: Ballot) -> Result<PrepareReply, PaxosError> {
        let accepted = ballot >= self.ballot;
        if !accepted {
            debug!(group = %self.group, %ballot, promised = %self.ballot, "rejecting stale prepare");
            return Ok(PrepareReply {
                acceptor: self.id,
                ballot: self.ballot,
                accepted,
                pvalues: vec![],
                next_to_execute: self.next_to_execute,
            });
        }
        self.promise(ballot)?;

        // Buffered decisions count as accepted: the new coordinator must
        // re-propose them like any other vote.
        let pvalues = self
            .accepted
            .range(self.next_to_execute..)
            .map(|(_, p)| p.clone())
            .chain(
                self.decisions
                    .range(self.next_to_execute..)
                    .map(|(_, d)| d.pvalue.clone()),
            )
            .collect();

        Ok(PrepareReply {
            acceptor: self.id,
            ballot,
            accepted,
            pvalues,
            next_to_execute: self.next_to_execute,
        })
    }

    /// Phase 2b.
    pub fn handle_accept(&mut self, pvalue: PValue) -> Result<AcceptReply, PaxosError> {
        let slot = pvalue.slot;
        let accepted = pvalue.ballot >= self.ballot;
        if accepted {
            self.promise(pvalue.ballot)?;
            let undecided = slot >= self.next_to_execute && !self.decisions.contains_key(&slot);
            let newer = self
                .accepted
                .get(&slot)
                .map_or(true, |old| pvalue.ballot >= old.ballot);
            if undecided && newer {
                self.storage.put_accepted(&self.group, &pvalue)?;
                self.accepted.insert(slot, pvalue);
            }
        } else {
            debug!(group = %self.group, slot, ballot = %pvalue.ballot, promised = %self.ballot, "rejecting stale accept");
        }

        Ok(AcceptReply {
            acceptor: self.id,
            slot,
            ballot: self.ballot,
            accepted,
            next_to_execute: self.next_to_execute,
        })
    }

    /// Records a decision and executes every decision that is now contiguous.
    ///
    /// Returns how many slots were executed. Duplicates execute nothing.
    pub fn commit<F>(&mut self, decision: Decision, apply: F) -> Result<usize, PaxosError>
    where
        F: FnMut(&Decision) -> Result<(), PaxosError>,
    {
        let slot = decision.slot();
        if slot < self.next_to_execute || self.decisions.contains_key(&slot) {
            debug!(group = %self.group, slot, "ignoring duplicate decision");
            return Ok(0);
        }
        if let Some(ours) = self.accepted.get(&slot) {
            if ours.ballot == decision.pvalue.ballot && ours.request != decision.pvalue.request {
                warn!(group = %self.group, slot, "decision differs from vote at the same ballot");
            }
        }

        // Never execute or acknowledge what is not durable.
        self.storage.put_decision(&self.group, &decision)?;
        self.accepted.remove(&slot);
        self.decisions.insert(slot, decision);

        self.execute_ready(apply)
    }

    /// Executes buffered decisions from `next_to_execute` until the first gap.
    pub fn execute_ready<F>(&mut self, mut apply: F) -> Result<usize, PaxosError>
    where
        F: FnMut(&Decision) -> Result<(), PaxosError>,
    {
        let mut executed = 0;
        while let Some(decision) = self.decisions.get(&self.next_to_execute) {
            apply(decision)?;
            self.next_to_execute += 1;
            executed += 1;
        }
        Ok(executed)
    }

    /// Skips to a checkpoint received from a peer (or restored locally).
    ///
    /// The caller has already installed the application state. Returns false
    /// if the checkpoint is not ahead of us.
    pub fn install_checkpoint(&mut self, next_to_execute: Slot) -> bool {
        if next_to_execute <= self.next_to_execute {
            return false;
        }
        self.next_to_execute = next_to_execute;
        self.accepted = self.accepted.split_off(&next_to_execute);
        self.decisions = self.decisions.split_off(&next_to_execute);
        let covered = next_to_execute - 1;
        self.gc_slot = Some(self.gc_slot.map_or(covered, |g| g.max(covered)));
        true
    }

    /// Drops every entry at or below `min(committed_up_to, majority_committed_slot)`.
    ///
    /// Returns the new GC watermark if it moved.
    pub fn garbage_collect(&mut self, majority_committed_slot: Option<Slot>) -> Result<Option<Slot>, PaxosError> {
        let (Some(majority), Some(committed)) = (majority_committed_slot, self.committed_up_to()) else {
            return Ok(None);
        };
        let up_to = majority.min(committed);
        if self.gc_slot.is_some_and(|g| g >= up_to) {
            return Ok(None);
        }

        self.decisions = self.decisions.split_off(&(up_to + 1));
        self.accepted = self.accepted.split_off(&(up_to + 1));
        self.gc_slot = Some(up_to);
        self.storage.garbage_collect(&self.group, up_to)?;
        debug!(group = %self.group, gc_slot = up_to, "garbage collected log");
        Ok(Some(up_to))
    }
}
