use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use serde_derive::Serialize;
use tracing::{debug, info, warn};

use super::{
    acceptor::AcceptorState,
    coordinator::{AcceptOutcome, Coordinator, PrepareOutcome, ProposeOutcome},
    storage::{Checkpoint, GroupLog, PaxosStorage},
    Ballot, Decision, GroupId, Outgoing, PValue, PaxosMessage, Replicable, RequestPacket, Slot,
};
use crate::{NodeIdx, PaxosConfig, PaxosError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Normal,
    /// The coordinator is suspected and a successor has not shown up yet.
    Electing,
    /// Replaying the durable log.
    Recovering,
}

/// Snapshot for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub group: GroupId,
    pub state: InstanceState,
    pub members: Vec<NodeIdx>,
    pub ballot: Ballot,
    pub coordinating: bool,
    pub next_to_execute: Slot,
    pub gc_slot: Option<Slot>,
    pub pending: usize,
    pub stopped: bool,
}

/// Executes one decision against the application.
///
/// No-ops are skipped, and so is everything after a stop request.
fn execute(app: &dyn Replicable, group: &str, decision: &Decision, stopped: &mut bool) -> Result<(), PaxosError> {
    let request = &decision.pvalue.request;
    let slot = decision.slot();
    if *stopped {
        debug!(group, slot, "group stopped, not executing");
        return Ok(());
    }
    if request.noop {
        return Ok(());
    }
    app.apply_decision(group, slot, request)
        .map_err(|e| PaxosError::Application {
            group: group.to_string(),
            slot,
            reason: e.to_string(),
        })?;
    if request.stop {
        info!(group, slot, "stop request executed");
        *stopped = true;
    }
    Ok(())
}

/// One node's participation in one group.
pub struct PaxosInstance {
    group: GroupId,
    me: NodeIdx,
    /// Sorted.
    members: Vec<NodeIdx>,
    config: PaxosConfig,
    app: Arc<dyn Replicable>,
    storage: Arc<dyn PaxosStorage>,

    acceptor: AcceptorState,
    coordinator: Coordinator,
    state: InstanceState,
    stopped: bool,
    /// Requests with nowhere to go yet.
    pending: VecDeque<RequestPacket>,
    last_sync: Option<Instant>,
    /// `next_to_execute` of the latest local checkpoint.
    last_checkpoint: Slot,
}

impl PaxosInstance {
    /// Creates a fresh instance. The first member coordinates ballot 0.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: GroupId,
        me: NodeIdx,
        members: &[NodeIdx],
        initial_state: Option<&[u8]>,
        config: PaxosConfig,
        app: Arc<dyn Replicable>,
        storage: Arc<dyn PaxosStorage>,
        now: Instant,
    ) -> Result<Self, PaxosError> {
        let mut members = members.to_vec();
        members.sort_unstable();
        members.dedup();
        if !members.contains(&me) {
            return Err(PaxosError::UnknownNode(me, group));
        }

        storage.put_group(&group, &members)?;
        if let Some(state) = initial_state {
            app.put_state(&group, state).map_err(|e| PaxosError::Application {
                group: group.clone(),
                slot: 0,
                reason: e.to_string(),
            })?;
            storage.put_checkpoint(
                &group,
                &Checkpoint {
                    next_to_execute: 0,
                    state: state.to_vec(),
                    stopped: false,
                },
            )?;
        }

        let acceptor = AcceptorState::new(group.clone(), me, &members, storage.clone());
        let mut coordinator = Coordinator::new(group.clone(), &config);
        if members[0] == me {
            coordinator.make_coordinator(Ballot::initial(&members), &members, 0, now);
        }
        info!(group = %group, me, ?members, "created paxos instance");

        Ok(Self {
            group,
            me,
            members,
            config,
            app,
            storage,
            acceptor,
            coordinator,
            state: InstanceState::Normal,
            stopped: false,
            pending: VecDeque::new(),
            last_sync: None,
            last_checkpoint: 0,
        })
    }

    /// Rebuilds an instance from its durable log and replays retained decisions.
    ///
    /// A node that was coordinating before the crash contends again with a
    /// fresh ballot instead of trusting its old one.
    pub fn recover(
        group: GroupId,
        me: NodeIdx,
        log: GroupLog,
        config: PaxosConfig,
        app: Arc<dyn Replicable>,
        storage: Arc<dyn PaxosStorage>,
        now: Instant,
    ) -> Result<(Self, Vec<Outgoing>), PaxosError> {
        if !log.members.contains(&me) {
            return Err(PaxosError::UnknownNode(me, group));
        }
        if let Some(checkpoint) = &log.checkpoint {
            app.put_state(&group, &checkpoint.state)
                .map_err(|e| PaxosError::Application {
                    group: group.clone(),
                    slot: checkpoint.next_to_execute,
                    reason: e.to_string(),
                })?;
        }

        let acceptor = AcceptorState::recover(group.clone(), me, &log, storage.clone());
        let mut instance = Self {
            coordinator: Coordinator::new(group.clone(), &config),
            last_checkpoint: acceptor.next_to_execute(),
            group,
            me,
            members: log.members,
            config,
            app,
            storage,
            acceptor,
            state: InstanceState::Recovering,
            stopped: log.checkpoint.as_ref().is_some_and(|c| c.stopped),
            pending: VecDeque::new(),
            last_sync: None,
        };

        let replayed = instance
            .acceptor
            .execute_ready(|d| execute(&*instance.app, &instance.group, d, &mut instance.stopped))?;
        instance.state = InstanceState::Normal;
        info!(
            group = %instance.group,
            replayed,
            next_to_execute = instance.acceptor.next_to_execute(),
            ballot = %instance.acceptor.ballot(),
            "recovered paxos instance"
        );

        let out = if instance.acceptor.ballot().coordinator == me && !instance.stopped {
            instance.contend(now)
        } else {
            vec![]
        };
        Ok((instance, out))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn members(&self) -> &[NodeIdx] {
        &self.members
    }

    pub fn is_member(&self, node: NodeIdx) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn next_to_execute(&self) -> Slot {
        self.acceptor.next_to_execute()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.is_active()
    }

    /// Whoever holds the highest ballot we have promised.
    pub fn believed_coordinator(&self) -> NodeIdx {
        self.acceptor.ballot().coordinator
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            group: self.group.clone(),
            state: self.state,
            members: self.members.clone(),
            ballot: self.acceptor.ballot(),
            coordinating: self.coordinator.is_active(),
            next_to_execute: self.acceptor.next_to_execute(),
            gc_slot: self.acceptor.gc_slot(),
            pending: self.pending.len(),
            stopped: self.stopped,
        }
    }

    fn broadcast(&self, message: PaxosMessage) -> Vec<Outgoing> {
        self.members
            .iter()
            .map(|to| Outgoing {
                to: *to,
                message: message.clone(),
            })
            .collect()
    }

    fn accepts(&self, pvalues: Vec<PValue>, out: &mut Vec<Outgoing>) {
        for pvalue in pvalues {
            out.extend(self.broadcast(PaxosMessage::Accept(pvalue)));
        }
    }

    /// Entry point for a client request handed to this node.
    pub fn propose(&mut self, request: RequestPacket, now: Instant) -> Result<Vec<Outgoing>, PaxosError> {
        if self.stopped {
            return Err(PaxosError::Stopped(self.group.clone()));
        }
        self.pending.push_back(request);
        let mut out = vec![];
        self.flush_pending(now, &mut out);
        Ok(out)
    }

    /// Moves pending requests to our coordinator, or to the believed one.
    fn flush_pending(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        if self.pending.is_empty() {
            return;
        }
        if self.stopped {
            warn!(group = %self.group, dropped = self.pending.len(), "group stopped, dropping requests");
            self.pending.clear();
            return;
        }

        if self.coordinator.exists() {
            while !self.coordinator.is_overloaded(self.acceptor.next_to_execute()) {
                let Some(request) = self.pending.pop_front() else {
                    break;
                };
                match self.coordinator.propose(request, now) {
                    ProposeOutcome::Accept(pvalue) => {
                        debug!(group = %self.group, slot = pvalue.slot, "proposing");
                        out.extend(self.broadcast(PaxosMessage::Accept(pvalue)));
                    }
                    ProposeOutcome::Queued => {}
                    ProposeOutcome::NotCoordinator(request) => {
                        self.pending.push_front(request);
                        break;
                    }
                }
            }
            return;
        }

        let leader = self.believed_coordinator();
        if self.state == InstanceState::Electing || leader == self.me {
            return;
        }
        debug!(group = %self.group, leader, count = self.pending.len(), "forwarding requests");
        out.extend(self.pending.drain(..).map(|request| Outgoing {
            to: leader,
            message: PaxosMessage::Request(request),
        }));
    }

    /// Hands requests to the coordinator of `ballot`.
    fn forward(&mut self, ballot: Ballot, requests: Vec<RequestPacket>, now: Instant, out: &mut Vec<Outgoing>) {
        if ballot.coordinator == self.me {
            self.pending.extend(requests);
            self.flush_pending(now, out);
            return;
        }
        out.extend(requests.into_iter().map(|request| Outgoing {
            to: ballot.coordinator,
            message: PaxosMessage::Request(request),
        }));
    }

    /// A higher ballot showed up: step down and stop electing.
    fn observe_ballot(&mut self, ballot: Ballot, now: Instant, out: &mut Vec<Outgoing>) {
        if ballot.coordinator == self.me {
            return;
        }
        if self.coordinator.ballot().is_some_and(|ours| ballot > ours) {
            let pending = self.coordinator.resign();
            info!(group = %self.group, %ballot, forwarded = pending.len(), "higher ballot seen, resigning");
            self.forward(ballot, pending, now, out);
        }
        if self.state == InstanceState::Electing && !self.coordinator.exists() {
            self.state = InstanceState::Normal;
        }
    }

    /// Dispatches one protocol message.
    pub fn handle(&mut self, sender: NodeIdx, message: PaxosMessage, now: Instant) -> Result<Vec<Outgoing>, PaxosError> {
        let mut out = vec![];
        match message {
            PaxosMessage::Request(request) => return self.propose(request, now),
            PaxosMessage::Proposal(proposal) => return self.propose(proposal.request, now),
            PaxosMessage::Preempted(pvalue) => {
                if !pvalue.request.noop {
                    return self.propose(pvalue.request, now);
                }
            }
            PaxosMessage::Prepare { ballot, .. } => {
                let reply = self.acceptor.handle_prepare(ballot)?;
                if reply.accepted {
                    self.observe_ballot(ballot, now, &mut out);
                }
                out.push(Outgoing {
                    to: sender,
                    message: PaxosMessage::PrepareReply(reply),
                });
            }
            PaxosMessage::PrepareReply(reply) => match self.coordinator.handle_prepare_reply(reply, now) {
                PrepareOutcome::Ignored => {}
                PrepareOutcome::Activated(accepts) => {
                    self.state = InstanceState::Normal;
                    self.accepts(accepts, &mut out);
                }
                PrepareOutcome::Preempted { ballot, pending } => {
                    self.state = InstanceState::Normal;
                    self.forward(ballot, pending, now, &mut out);
                }
            },
            PaxosMessage::Accept(pvalue) => self.handle_accept(sender, pvalue, now, &mut out)?,
            PaxosMessage::AcceptReply(reply) => match self.coordinator.handle_accept_reply(reply) {
                AcceptOutcome::Ignored => {}
                AcceptOutcome::Committed(decision) => {
                    debug!(group = %self.group, slot = decision.slot(), "decided");
                    out.extend(self.broadcast(PaxosMessage::Decision(decision)));
                }
                AcceptOutcome::Preempted {
                    ballot,
                    pvalue,
                    resigned,
                } => {
                    if !pvalue.request.noop {
                        out.push(Outgoing {
                            to: ballot.coordinator,
                            message: PaxosMessage::Preempted(pvalue),
                        });
                    }
                    if let Some(pending) = resigned {
                        self.forward(ballot, pending, now, &mut out);
                    }
                }
            },
            PaxosMessage::Decision(decision) => self.handle_decision(sender, decision, now, &mut out)?,
            PaxosMessage::SyncRequest {
                missing,
                next_to_execute,
            } => self.handle_sync_request(sender, missing, next_to_execute, &mut out),
            PaxosMessage::Checkpoint {
                next_to_execute,
                state,
                stopped,
            } => self.handle_checkpoint(next_to_execute, state, stopped)?,
        }
        self.flush_pending(now, &mut out);
        Ok(out)
    }

    fn handle_accept(&mut self, sender: NodeIdx, pvalue: PValue, now: Instant, out: &mut Vec<Outgoing>) -> Result<(), PaxosError> {
        if pvalue.slot < self.acceptor.next_to_execute() {
            if let Some(decision) = self.acceptor.decision(pvalue.slot) {
                out.push(Outgoing {
                    to: sender,
                    message: PaxosMessage::Decision(decision.clone()),
                });
                return Ok(());
            }
        }
        let ballot = pvalue.ballot;
        let reply = self.acceptor.handle_accept(pvalue)?;
        if reply.accepted {
            self.observe_ballot(ballot, now, out);
        }
        out.push(Outgoing {
            to: sender,
            message: PaxosMessage::AcceptReply(reply),
        });
        Ok(())
    }

    fn handle_decision(&mut self, sender: NodeIdx, decision: Decision, now: Instant, out: &mut Vec<Outgoing>) -> Result<(), PaxosError> {
        let majority_committed_slot = decision.majority_committed_slot;
        let executed = self
            .acceptor
            .commit(decision, |d| execute(&*self.app, &self.group, d, &mut self.stopped))?;
        if executed > 0 {
            self.maybe_checkpoint()?;
            if self.stopped {
                let dropped = self.coordinator.resign();
                if !dropped.is_empty() {
                    warn!(group = %self.group, dropped = dropped.len(), "group stopped with undecided requests");
                }
            }
        }
        self.acceptor.garbage_collect(majority_committed_slot)?;
        self.request_sync(sender, now, out);
        Ok(())
    }

    /// Asks `peer` for decisions we are missing, at most once per sync timeout.
    fn request_sync(&mut self, peer: NodeIdx, now: Instant, out: &mut Vec<Outgoing>) {
        let missing = self.acceptor.missing_slots();
        if missing.is_empty() || peer == self.me || self.sync_throttled(now) {
            return;
        }
        self.last_sync = Some(now);
        debug!(group = %self.group, peer, ?missing, "requesting sync");
        out.push(Outgoing {
            to: peer,
            message: PaxosMessage::SyncRequest {
                missing,
                next_to_execute: self.acceptor.next_to_execute(),
            },
        });
    }

    /// Tells the other members how far we have executed, at most once per
    /// sync timeout. Peers that are ahead answer with decisions or a checkpoint.
    fn announce_watermark(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        if self.sync_throttled(now) {
            return;
        }
        self.last_sync = Some(now);
        let message = PaxosMessage::SyncRequest {
            missing: self.acceptor.missing_slots(),
            next_to_execute: self.acceptor.next_to_execute(),
        };
        let me = self.me;
        out.extend(self.broadcast(message).into_iter().filter(|o| o.to != me));
    }

    fn sync_throttled(&self, now: Instant) -> bool {
        self.last_sync
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.sync_timeout())
    }

    fn handle_sync_request(&mut self, sender: NodeIdx, missing: Vec<Slot>, next_to_execute: Slot, out: &mut Vec<Outgoing>) {
        let collected = self
            .acceptor
            .gc_slot()
            .is_some_and(|gc| next_to_execute <= gc || missing.iter().any(|s| *s <= gc));
        if collected && next_to_execute < self.acceptor.next_to_execute() {
            if let Some(state) = self.app.get_state(&self.group) {
                info!(group = %self.group, peer = sender, next_to_execute = self.acceptor.next_to_execute(), "sending checkpoint");
                out.push(Outgoing {
                    to: sender,
                    message: PaxosMessage::Checkpoint {
                        next_to_execute: self.acceptor.next_to_execute(),
                        state,
                        stopped: self.stopped,
                    },
                });
            }
        }

        let decisions = missing
            .into_iter()
            .chain(next_to_execute..self.acceptor.next_to_execute())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|slot| self.acceptor.decision(slot).cloned())
            .map(|decision| Outgoing {
                to: sender,
                message: PaxosMessage::Decision(decision),
            });
        out.extend(decisions);
    }

    fn handle_checkpoint(&mut self, next_to_execute: Slot, state: Vec<u8>, stopped: bool) -> Result<(), PaxosError> {
        if next_to_execute <= self.acceptor.next_to_execute() {
            return Ok(());
        }
        self.app
            .put_state(&self.group, &state)
            .map_err(|e| PaxosError::Application {
                group: self.group.clone(),
                slot: next_to_execute,
                reason: e.to_string(),
            })?;
        self.storage.put_checkpoint(
            &self.group,
            &Checkpoint {
                next_to_execute,
                state,
                stopped,
            },
        )?;
        self.acceptor.install_checkpoint(next_to_execute);
        self.last_checkpoint = next_to_execute;
        info!(group = %self.group, next_to_execute, stopped, "installed checkpoint");

        // The stop decision itself was skipped along with the slots before it.
        if stopped && !self.stopped {
            self.stopped = true;
            self.coordinator.resign();
        }

        self.acceptor
            .execute_ready(|d| execute(&*self.app, &self.group, d, &mut self.stopped))?;
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> Result<(), PaxosError> {
        // The stop decision must stay in the log so recovery replays it.
        let next_to_execute = self.acceptor.next_to_execute();
        if self.stopped || next_to_execute < self.last_checkpoint + self.config.checkpoint_interval.max(1) {
            return Ok(());
        }
        let Some(state) = self.app.get_state(&self.group) else {
            return Ok(());
        };
        self.storage.put_checkpoint(
            &self.group,
            &Checkpoint {
                next_to_execute,
                state,
                stopped: false,
            },
        )?;
        self.last_checkpoint = next_to_execute;
        debug!(group = %self.group, next_to_execute, "checkpointed");
        Ok(())
    }

    /// Starts a phase-1 round with the next ballot we own.
    pub fn contend(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = vec![];
        if self.stopped {
            return out;
        }
        let Some(position) = self.members.iter().position(|m| *m == self.me) else {
            return out;
        };
        let highest = self
            .coordinator
            .ballot()
            .map_or(self.acceptor.ballot(), |ours| ours.max(self.acceptor.ballot()));
        let ballot = Ballot::next_for(highest, position, &self.members);
        info!(group = %self.group, %ballot, "contending for coordinator");

        self.state = InstanceState::Electing;
        if let Some(prepare) =
            self.coordinator
                .make_coordinator(ballot, &self.members, self.acceptor.next_to_execute(), now)
        {
            out.extend(self.broadcast(prepare));
        }
        self.flush_pending(now, &mut out);
        out
    }

    /// Failure-detector callback. Only the first live member after the
    /// suspected coordinator, in round-robin order, contends.
    pub fn handle_coordinator_suspected(&mut self, suspected: &HashSet<NodeIdx>, now: Instant) -> Vec<Outgoing> {
        let current = self.believed_coordinator();
        if !suspected.contains(&current) || self.coordinator.exists() || self.stopped {
            return vec![];
        }
        let n = self.members.len();
        let start = self.members.iter().position(|m| *m == current).unwrap_or(0);
        let successor = (1..=n)
            .map(|i| self.members[(start + i) % n])
            .find(|m| !suspected.contains(m));

        match successor {
            Some(next) if next == self.me => self.contend(now),
            _ => {
                if self.state != InstanceState::Electing {
                    info!(group = %self.group, suspected = current, ?successor, "coordinator suspected");
                }
                self.state = InstanceState::Electing;
                vec![]
            }
        }
    }

    /// Periodic work: stalled rounds, catch-up and queued requests.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = vec![];
        if let Some(prepare) = self.coordinator.re_prepare(now) {
            debug!(group = %self.group, "re-sending prepare");
            out.extend(self.broadcast(prepare));
        }
        let stalled = self.coordinator.re_commander(now);
        if !stalled.is_empty() {
            debug!(group = %self.group, count = stalled.len(), "re-sending accepts");
            self.accepts(stalled, &mut out);
        }

        self.announce_watermark(now, &mut out);

        let orphaned = !self.pending.is_empty()
            && !self.coordinator.exists()
            && self.state == InstanceState::Normal
            && self.believed_coordinator() == self.me;
        if orphaned {
            out.extend(self.contend(now));
        } else {
            self.flush_pending(now, &mut out);
        }
        out
    }

    /// Serialized application state, with the slot it reflects.
    pub fn get_state(&self) -> Option<(Slot, Vec<u8>)> {
        self.app
            .get_state(&self.group)
            .map(|state| (self.acceptor.next_to_execute(), state))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use parking_lot::Mutex;

    use super::*;
    use crate::paxos::{storage::MemoryStorage, BoxError};

    #[derive(Default)]
    struct Recorder {
        executed: Mutex<Vec<(Slot, Vec<u8>)>>,
        states: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl Replicable for Recorder {
        fn apply_decision(&self, group: &str, slot: Slot, request: &RequestPacket) -> Result<(), BoxError> {
            self.executed.lock().push((slot, request.value.clone()));
            self.states
                .lock()
                .entry(group.to_string())
                .or_default()
                .extend_from_slice(&request.value);
            Ok(())
        }

        fn get_state(&self, group: &str) -> Option<Vec<u8>> {
            self.states.lock().get(group).cloned()
        }

        fn put_state(&self, group: &str, state: &[u8]) -> Result<(), BoxError> {
            self.states.lock().insert(group.to_string(), state.to_vec());
            Ok(())
        }
    }

    const MEMBERS: [NodeIdx; 3] = [0, 1, 2];

    fn instance(me: NodeIdx) -> (PaxosInstance, Arc<Recorder>) {
        let app = Arc::new(Recorder::default());
        let instance = PaxosInstance::new(
            "g".into(),
            me,
            &MEMBERS,
            None,
            PaxosConfig::default(),
            app.clone(),
            Arc::new(MemoryStorage::new()),
            Instant::now(),
        )
        .expect("instance");
        (instance, app)
    }

    fn decision(slot: Slot, value: &str) -> Decision {
        Decision {
            pvalue: PValue::new(slot, Ballot::new(0, 0), RequestPacket::new(slot, 1, value)),
            majority_committed_slot: None,
        }
    }

    #[test]
    fn first_member_bootstraps_as_coordinator() {
        let (leader, _) = instance(0);
        let (follower, _) = instance(2);
        assert!(leader.is_coordinator());
        assert!(!follower.is_coordinator());
        assert_eq!(follower.believed_coordinator(), 0);
    }

    #[test]
    fn follower_forwards_requests() {
        let (mut follower, _) = instance(1);
        let out = follower
            .propose(RequestPacket::new(1, 9, "x"), Instant::now())
            .expect("propose");
        assert_eq!(
            out,
            vec![Outgoing {
                to: 0,
                message: PaxosMessage::Request(RequestPacket::new(1, 9, "x")),
            }]
        );
    }

    #[test]
    fn coordinator_broadcasts_accepts() {
        let (mut leader, _) = instance(0);
        let out = leader
            .propose(RequestPacket::new(1, 9, "x"), Instant::now())
            .expect("propose");
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|o| matches!(&o.message, PaxosMessage::Accept(p) if p.slot == 0)));
    }

    #[test]
    fn gap_triggers_sync_request() {
        let (mut node, app) = instance(2);
        let now = Instant::now();
        let out = node
            .handle(0, PaxosMessage::Decision(decision(2, "c")), now)
            .expect("decision");
        assert_eq!(
            out,
            vec![Outgoing {
                to: 0,
                message: PaxosMessage::SyncRequest {
                    missing: vec![0, 1],
                    next_to_execute: 0,
                },
            }]
        );

        // Rate limited.
        let out = node
            .handle(0, PaxosMessage::Decision(decision(3, "d")), now)
            .expect("decision");
        assert!(out.is_empty());

        node.handle(0, PaxosMessage::Decision(decision(1, "b")), now).expect("decision");
        node.handle(0, PaxosMessage::Decision(decision(0, "a")), now).expect("decision");
        let slots = app.executed.lock().iter().map(|(s, _)| *s).collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sync_request_answered_with_retained_decisions() {
        let (mut node, _) = instance(1);
        let now = Instant::now();
        for slot in 0..3 {
            node.handle(0, PaxosMessage::Decision(decision(slot, "v")), now)
                .expect("decision");
        }
        let out = node
            .handle(
                2,
                PaxosMessage::SyncRequest {
                    missing: vec![1],
                    next_to_execute: 1,
                },
                now,
            )
            .expect("sync");
        let mut slots = out
            .iter()
            .filter_map(|o| match &o.message {
                PaxosMessage::Decision(d) if o.to == 2 => Some(d.slot()),
                _ => None,
            })
            .collect::<Vec<_>>();
        slots.sort_unstable();
        assert_eq!(slots, vec![1, 2]);
    }

    #[test]
    fn collected_slots_are_answered_with_checkpoint() {
        let (mut node, _) = instance(1);
        let now = Instant::now();
        let mut d = decision(0, "a");
        node.handle(0, PaxosMessage::Decision(d.clone()), now).expect("decision");
        d = decision(1, "b");
        d.majority_committed_slot = Some(1);
        node.handle(0, PaxosMessage::Decision(d), now).expect("decision");
        assert_eq!(node.status().gc_slot, Some(1));

        let out = node
            .handle(
                2,
                PaxosMessage::SyncRequest {
                    missing: vec![0],
                    next_to_execute: 0,
                },
                now,
            )
            .expect("sync");
        assert_eq!(
            out,
            vec![Outgoing {
                to: 2,
                message: PaxosMessage::Checkpoint {
                    next_to_execute: 2,
                    state: b"ab".to_vec(),
                    stopped: false,
                },
            }]
        );
    }

    #[test]
    fn checkpoint_installs_state_and_resumes() {
        let (mut node, app) = instance(2);
        let now = Instant::now();
        node.handle(0, PaxosMessage::Decision(decision(5, "f")), now).expect("decision");
        node.handle(
            0,
            PaxosMessage::Checkpoint {
                next_to_execute: 5,
                state: b"abcde".to_vec(),
                stopped: false,
            },
            now,
        )
        .expect("checkpoint");

        assert_eq!(node.next_to_execute(), 6);
        assert_eq!(app.get_state("g"), Some(b"abcdef".to_vec()));
    }

    #[test]
    fn accept_for_executed_slot_returns_decision() {
        let (mut node, _) = instance(1);
        let now = Instant::now();
        node.handle(0, PaxosMessage::Decision(decision(0, "a")), now).expect("decision");
        let out = node
            .handle(0, PaxosMessage::Accept(decision(0, "a").pvalue), now)
            .expect("accept");
        assert_eq!(
            out,
            vec![Outgoing {
                to: 0,
                message: PaxosMessage::Decision(decision(0, "a")),
            }]
        );
    }

    #[test]
    fn only_successor_contends() {
        let now = Instant::now();
        let suspected = HashSet::from([0]);

        let (mut one, _) = instance(1);
        let out = one.handle_coordinator_suspected(&suspected, now);
        assert_eq!(out.len(), 3);
        assert!(matches!(
            &out[0].message,
            PaxosMessage::Prepare { ballot, .. } if *ballot == Ballot::new(1, 1)
        ));
        assert_eq!(one.state(), InstanceState::Electing);

        let (mut two, _) = instance(2);
        assert!(two.handle_coordinator_suspected(&suspected, now).is_empty());
        assert_eq!(two.state(), InstanceState::Electing);

        // Requests wait until a coordinator shows up.
        let out = two.propose(RequestPacket::new(1, 1, "x"), now).expect("propose");
        assert!(out.is_empty());
        let out = two
            .handle(
                1,
                PaxosMessage::Prepare {
                    ballot: Ballot::new(1, 1),
                    members: MEMBERS.to_vec(),
                },
                now,
            )
            .expect("prepare");
        assert_eq!(two.state(), InstanceState::Normal);
        assert!(out
            .iter()
            .any(|o| o.to == 1 && matches!(o.message, PaxosMessage::Request(_))));
    }

    #[test]
    fn stop_request_freezes_group() {
        let (mut node, app) = instance(1);
        let now = Instant::now();
        let stop = Decision {
            pvalue: PValue::new(0, Ballot::new(0, 0), RequestPacket::stop(1, 1)),
            majority_committed_slot: None,
        };
        node.handle(0, PaxosMessage::Decision(stop), now).expect("stop");
        node.handle(0, PaxosMessage::Decision(decision(1, "late")), now)
            .expect("decision");

        assert!(node.is_stopped());
        assert_eq!(app.executed.lock().len(), 1);
        assert!(matches!(
            node.propose(RequestPacket::new(2, 1, "x"), now),
            Err(PaxosError::Stopped(_))
        ));
    }

    #[test]
    fn periodic_checkpoint_is_persisted() {
        let app = Arc::new(Recorder::default());
        let storage = Arc::new(MemoryStorage::new());
        let config = PaxosConfig {
            checkpoint_interval: 2,
            ..PaxosConfig::default()
        };
        let mut node = PaxosInstance::new(
            "g".into(),
            1,
            &MEMBERS,
            None,
            config,
            app,
            storage.clone(),
            Instant::now(),
        )
        .expect("instance");
        for (slot, value) in ["a", "b", "c"].iter().enumerate() {
            node.handle(0, PaxosMessage::Decision(decision(slot as Slot, value)), Instant::now())
                .expect("decision");
        }

        let log = storage.load("g").expect("load").expect("group");
        let checkpoint = log.checkpoint.expect("checkpoint");
        assert_eq!(checkpoint.next_to_execute, 2);
        assert_eq!(checkpoint.state, b"ab".to_vec());
    }

    #[test]
    fn tick_resends_stalled_accepts() {
        let (mut leader, _) = instance(0);
        let start = Instant::now();
        leader.propose(RequestPacket::new(1, 1, "x"), start).expect("propose");
        let accepts = |out: &[Outgoing]| {
            out.iter()
                .filter(|o| matches!(o.message, PaxosMessage::Accept(_)))
                .count()
        };
        assert_eq!(accepts(&leader.tick(start)), 0);

        let later = start + Duration::from_secs(2);
        assert_eq!(accepts(&leader.tick(later)), 3);
    }

    #[test]
    fn tick_announces_watermark_to_peers() {
        let (mut node, _) = instance(2);
        let start = Instant::now();
        let out = node.tick(start);
        assert_eq!(
            out,
            [0, 1]
                .into_iter()
                .map(|to| Outgoing {
                    to,
                    message: PaxosMessage::SyncRequest {
                        missing: vec![],
                        next_to_execute: 0,
                    },
                })
                .collect::<Vec<_>>()
        );

        // Rate limited.
        assert!(node.tick(start + Duration::from_millis(10)).is_empty());
        assert_eq!(node.tick(start + Duration::from_secs(1)).len(), 2);
    }

    #[test]
    fn stopped_checkpoint_stops_member() {
        let (mut node, app) = instance(2);
        let now = Instant::now();
        node.handle(0, PaxosMessage::Decision(decision(6, "late")), now)
            .expect("decision");
        node.handle(
            0,
            PaxosMessage::Checkpoint {
                next_to_execute: 6,
                state: b"abcde".to_vec(),
                stopped: true,
            },
            now,
        )
        .expect("checkpoint");

        assert!(node.is_stopped());
        assert_eq!(node.next_to_execute(), 7);
        assert!(app.executed.lock().is_empty());
        assert_eq!(app.get_state("g"), Some(b"abcde".to_vec()));
        assert!(matches!(
            node.propose(RequestPacket::new(7, 1, "x"), now),
            Err(PaxosError::Stopped(_))
        ));
    }
}
