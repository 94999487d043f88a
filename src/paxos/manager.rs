use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    instance::{InstanceStatus, PaxosInstance},
    storage::PaxosStorage,
    GroupId, Messenger, Outgoing, PaxosMessage, PaxosPacket, Replicable, RequestPacket, Slot,
};
use crate::{NodeIdx, PaxosConfig, PaxosError};

/// Every paxos instance hosted by one node.
///
/// Each instance sits behind its own mutex, so groups make progress in
/// parallel. The map lock is only held to find, add or drop an instance, and
/// nothing is sent while an instance is locked.
pub struct PaxosManager {
    me: NodeIdx,
    config: PaxosConfig,
    app: Arc<dyn Replicable>,
    storage: Arc<dyn PaxosStorage>,
    messenger: Arc<dyn Messenger>,
    instances: RwLock<HashMap<GroupId, Arc<Mutex<PaxosInstance>>>>,
    suspected: Mutex<HashSet<NodeIdx>>,
}

impl PaxosManager {
    pub fn new(
        me: NodeIdx,
        config: PaxosConfig,
        app: Arc<dyn Replicable>,
        storage: Arc<dyn PaxosStorage>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            me,
            config,
            app,
            storage,
            messenger,
            instances: RwLock::new(HashMap::new()),
            suspected: Mutex::new(HashSet::new()),
        }
    }

    pub fn me(&self) -> NodeIdx {
        self.me
    }

    fn instance(&self, group: &str) -> Option<Arc<Mutex<PaxosInstance>>> {
        self.instances.read().get(group).cloned()
    }

    fn all_instances(&self) -> Vec<(GroupId, Arc<Mutex<PaxosInstance>>)> {
        self.instances
            .read()
            .iter()
            .map(|(g, i)| (g.clone(), i.clone()))
            .collect()
    }

    fn insert(&self, group: &str, instance: PaxosInstance) -> Result<(), PaxosError> {
        let mut instances = self.instances.write();
        if instances.contains_key(group) {
            return Err(PaxosError::GroupExists(group.to_string()));
        }
        instances.insert(group.to_string(), Arc::new(Mutex::new(instance)));
        Ok(())
    }

    /// Starts this node's instance of `group` with a fixed member set.
    pub fn create_group(&self, group: &str, members: &[NodeIdx], initial_state: Option<&[u8]>) -> Result<(), PaxosError> {
        if self.instances.read().contains_key(group) {
            return Err(PaxosError::GroupExists(group.to_string()));
        }
        let instance = PaxosInstance::new(
            group.to_string(),
            self.me,
            members,
            initial_state,
            self.config.clone(),
            self.app.clone(),
            self.storage.clone(),
            Instant::now(),
        )?;
        self.insert(group, instance)?;
        info!(group, "group created");
        Ok(())
    }

    /// Creates `group` with `state` as its starting application state.
    pub fn put_initial_state(&self, group: &str, members: &[NodeIdx], state: &[u8]) -> Result<(), PaxosError> {
        self.create_group(group, members, Some(state))
    }

    /// Removes a group whose stop request has executed, with its durable log.
    pub fn delete_group(&self, group: &str) -> Result<(), PaxosError> {
        let instance = self
            .instance(group)
            .ok_or_else(|| PaxosError::NoSuchGroup(group.to_string()))?;
        if !instance.lock().is_stopped() {
            return Err(PaxosError::NotStopped(group.to_string()));
        }
        self.instances.write().remove(group);
        self.storage.remove_group(group)?;
        info!(group, "group deleted");
        Ok(())
    }

    /// Re-creates every group found in storage. Returns how many came back.
    pub fn recover(&self) -> Result<usize, PaxosError> {
        let mut recovered = 0;
        for group in self.storage.groups()? {
            if self.instances.read().contains_key(&group) {
                continue;
            }
            let Some(log) = self.storage.load(&group)? else {
                continue;
            };
            let (instance, out) = match PaxosInstance::recover(
                group.clone(),
                self.me,
                log,
                self.config.clone(),
                self.app.clone(),
                self.storage.clone(),
                Instant::now(),
            ) {
                Ok(recovered) => recovered,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(group = %group, error = %e, "skipping group during recovery");
                    continue;
                }
            };
            self.insert(&group, instance)?;
            self.dispatch(&group, out);
            recovered += 1;
        }
        info!(recovered, "recovered groups from storage");
        Ok(recovered)
    }

    /// Submits a client request to `group` through this node.
    pub fn propose(&self, group: &str, request: RequestPacket) -> Result<(), PaxosError> {
        let instance = self
            .instance(group)
            .ok_or_else(|| PaxosError::NoSuchGroup(group.to_string()))?;
        let out = instance.lock().propose(request, Instant::now())?;
        self.dispatch(group, out);
        Ok(())
    }

    /// Decodes and handles one packet off the wire. Garbage is dropped.
    pub fn handle_bytes(&self, buf: &[u8]) {
        match PaxosPacket::decode(buf) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => warn!(error = %e, len = buf.len(), "dropping malformed packet"),
        }
    }

    pub fn handle_packet(&self, packet: PaxosPacket) {
        let PaxosPacket {
            group,
            sender,
            message,
        } = packet;
        let out = self.deliver(&group, sender, message);
        self.dispatch(&group, out);
    }

    /// Runs one message through its instance. Fatal errors end our
    /// participation in the group.
    fn deliver(&self, group: &str, sender: NodeIdx, message: PaxosMessage) -> Vec<Outgoing> {
        let Some(instance) = self.instance(group) else {
            debug!(group, sender, kind = message.kind(), "packet for unknown group");
            return vec![];
        };
        let kind = message.kind();
        let result = {
            let mut instance = instance.lock();
            if !instance.is_member(sender) {
                Err(PaxosError::UnknownNode(sender, group.to_string()))
            } else {
                instance.handle(sender, message, Instant::now())
            }
        };

        match result {
            Ok(out) => out,
            Err(e) if e.is_fatal() => {
                error!(group, error = %e, kind, "leaving group after fatal error");
                self.instances.write().remove(group);
                vec![]
            }
            Err(e) => {
                warn!(group, sender, error = %e, kind, "dropping message");
                vec![]
            }
        }
    }

    /// Sends what an instance produced. Messages to ourselves are handled
    /// right here, in order, until none are left.
    fn dispatch(&self, group: &str, mut out: Vec<Outgoing>) {
        let mut local = VecDeque::new();
        loop {
            for Outgoing { to, message } in out.drain(..) {
                if to == self.me {
                    local.push_back(message);
                } else {
                    self.messenger.send(
                        to,
                        &PaxosPacket {
                            group: group.to_string(),
                            sender: self.me,
                            message,
                        },
                    );
                }
            }
            let Some(message) = local.pop_front() else {
                break;
            };
            out = self.deliver(group, self.me, message);
        }
    }

    /// Timer entry point: re-sends stalled rounds and requests catch-up.
    pub fn tick(&self, now: Instant) {
        for (group, instance) in self.all_instances() {
            let out = instance.lock().tick(now);
            self.dispatch(&group, out);
        }
    }

    /// Failure-detector callback.
    pub fn node_failed(&self, node: NodeIdx) {
        let suspected = {
            let mut suspected = self.suspected.lock();
            if !suspected.insert(node) {
                return;
            }
            suspected.clone()
        };
        info!(node, "node suspected");
        let now = Instant::now();
        for (group, instance) in self.all_instances() {
            let out = instance.lock().handle_coordinator_suspected(&suspected, now);
            self.dispatch(&group, out);
        }
    }

    pub fn node_recovered(&self, node: NodeIdx) {
        if self.suspected.lock().remove(&node) {
            info!(node, "node no longer suspected");
        }
    }

    /// Current application state of `group` and the slot it reflects.
    pub fn get_state(&self, group: &str) -> Result<Option<(Slot, Vec<u8>)>, PaxosError> {
        let instance = self
            .instance(group)
            .ok_or_else(|| PaxosError::NoSuchGroup(group.to_string()))?;
        let state = instance.lock().get_state();
        Ok(state)
    }

    pub fn is_member(&self, group: &str, node: NodeIdx) -> bool {
        self.instance(group).is_some_and(|i| i.lock().is_member(node))
    }

    pub fn is_coordinator(&self, group: &str) -> bool {
        self.instance(group).is_some_and(|i| i.lock().is_coordinator())
    }

    pub fn status(&self, group: &str) -> Option<InstanceStatus> {
        self.instance(group).map(|i| i.lock().status())
    }

    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups = self.instances.read().keys().cloned().collect::<Vec<_>>();
        groups.sort();
        groups
    }
}
