//! In-memory network for driving whole groups from tests.
//!
//! All shared state lives in a [`Cluster`]; nothing is global, so tests run
//! in parallel.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use gigapaxos::{
    paxos::{
        manager::PaxosManager,
        storage::{MemoryStorage, PaxosStorage},
        BoxError, Messenger, PaxosPacket, Replicable, RequestPacket, Slot,
    },
    NodeIdx, PaxosConfig,
};
use parking_lot::Mutex;

pub const GROUP: &str = "names";

#[derive(Default)]
pub struct Network {
    queue: Mutex<VecDeque<(NodeIdx, Vec<u8>)>>,
    down: Mutex<HashSet<NodeIdx>>,
    /// Directed links that lose everything.
    cut: Mutex<HashSet<(NodeIdx, NodeIdx)>>,
    /// Directed links whose packets are parked until released.
    held_links: Mutex<HashSet<(NodeIdx, NodeIdx)>>,
    held: Mutex<Vec<(NodeIdx, Vec<u8>)>>,
    duplicate: AtomicBool,
}

impl Network {
    fn deliverable(&self, from: NodeIdx, to: NodeIdx) -> bool {
        !self.down.lock().contains(&to) && !self.cut.lock().contains(&(from, to))
    }
}

pub struct NetMessenger {
    me: NodeIdx,
    net: Arc<Network>,
}

impl Messenger for NetMessenger {
    fn send(&self, to: NodeIdx, packet: &PaxosPacket) {
        if !self.net.deliverable(self.me, to) {
            return;
        }
        let buf = packet.encode().expect("encode");
        if self.net.held_links.lock().contains(&(self.me, to)) {
            self.net.held.lock().push((to, buf));
            return;
        }
        let mut queue = self.net.queue.lock();
        if self.net.duplicate.load(Ordering::SeqCst) {
            queue.push_back((to, buf.clone()));
        }
        queue.push_back((to, buf));
    }
}

/// Records executions; its state is the list of executed values.
#[derive(Default)]
pub struct TestApp {
    executed: Mutex<HashMap<String, Vec<(Slot, Vec<u8>)>>>,
    state: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl TestApp {
    pub fn executed(&self, group: &str) -> Vec<(Slot, String)> {
        self.executed
            .lock()
            .get(group)
            .map(|e| {
                e.iter()
                    .map(|(s, v)| (*s, String::from_utf8_lossy(v).into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn values(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .get(group)
            .map(|s| s.iter().map(|v| String::from_utf8_lossy(v).into_owned()).collect())
            .unwrap_or_default()
    }
}

impl Replicable for TestApp {
    fn apply_decision(&self, group: &str, slot: Slot, request: &RequestPacket) -> Result<(), BoxError> {
        self.executed
            .lock()
            .entry(group.to_string())
            .or_default()
            .push((slot, request.value.clone()));
        if !request.stop {
            self.state
                .lock()
                .entry(group.to_string())
                .or_default()
                .push(request.value.clone());
        }
        Ok(())
    }

    fn get_state(&self, group: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().get(group).cloned().unwrap_or_default();
        serde_json::to_vec(&state).ok()
    }

    fn put_state(&self, group: &str, state: &[u8]) -> Result<(), BoxError> {
        let values: Vec<Vec<u8>> = serde_json::from_slice(state)?;
        self.state.lock().insert(group.to_string(), values);
        Ok(())
    }
}

pub struct Node {
    pub manager: PaxosManager,
    pub app: Arc<TestApp>,
    pub storage: Arc<dyn PaxosStorage>,
}

pub struct Cluster {
    pub net: Arc<Network>,
    pub nodes: Vec<Node>,
    /// Set when the cluster was built on in-memory storage.
    pub memory: Vec<Arc<MemoryStorage>>,
    config: PaxosConfig,
}

impl Cluster {
    pub fn new(n: u32) -> Self {
        Self::with_config(n, PaxosConfig::default())
    }

    pub fn with_config(n: u32, config: PaxosConfig) -> Self {
        let memory = (0..n).map(|_| Arc::new(MemoryStorage::new())).collect::<Vec<_>>();
        let storages = memory
            .iter()
            .map(|m| m.clone() as Arc<dyn PaxosStorage>)
            .collect();
        let mut cluster = Self::with_storage(storages, config);
        cluster.memory = memory;
        cluster
    }

    pub fn with_storage(storages: Vec<Arc<dyn PaxosStorage>>, config: PaxosConfig) -> Self {
        let net = Arc::new(Network::default());
        let nodes = storages
            .into_iter()
            .enumerate()
            .map(|(idx, storage)| Self::node(&net, idx as NodeIdx, storage, &config))
            .collect();
        Self {
            net,
            nodes,
            memory: vec![],
            config,
        }
    }

    fn node(net: &Arc<Network>, me: NodeIdx, storage: Arc<dyn PaxosStorage>, config: &PaxosConfig) -> Node {
        let app = Arc::new(TestApp::default());
        let manager = PaxosManager::new(
            me,
            config.clone(),
            app.clone(),
            storage.clone(),
            Arc::new(NetMessenger { me, net: net.clone() }),
        );
        Node { manager, app, storage }
    }

    pub fn members(&self) -> Vec<NodeIdx> {
        (0..self.nodes.len() as NodeIdx).collect()
    }

    pub fn create_group(&self, group: &str) {
        let members = self.members();
        for node in &self.nodes {
            node.manager.create_group(group, &members, None).expect("create group");
        }
    }

    pub fn manager(&self, idx: NodeIdx) -> &PaxosManager {
        &self.nodes[idx as usize].manager
    }

    pub fn app(&self, idx: NodeIdx) -> &TestApp {
        &self.nodes[idx as usize].app
    }

    pub fn propose(&self, via: NodeIdx, request_id: u64, value: &str) {
        self.manager(via)
            .propose(GROUP, RequestPacket::new(request_id, 100, value))
            .expect("propose");
    }

    /// Delivers queued packets until the network is quiet.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.net.queue.lock().pop_front();
            let Some((to, buf)) = next else {
                return delivered;
            };
            if self.net.down.lock().contains(&to) {
                continue;
            }
            self.nodes[to as usize].manager.handle_bytes(&buf);
            delivered += 1;
            assert!(delivered < 100_000, "network never went quiet");
        }
    }

    pub fn cut(&self, from: NodeIdx, to: NodeIdx) {
        self.net.cut.lock().insert((from, to));
    }

    pub fn heal(&self) {
        self.net.cut.lock().clear();
    }

    pub fn hold(&self, from: NodeIdx, to: NodeIdx) {
        self.net.held_links.lock().insert((from, to));
    }

    /// Delivers parked packets in reverse order of sending.
    pub fn release_reordered(&self) {
        self.net.held_links.lock().clear();
        let held = std::mem::take(&mut *self.net.held.lock());
        self.net.queue.lock().extend(held.into_iter().rev());
    }

    pub fn duplicate_packets(&self, on: bool) {
        self.net.duplicate.store(on, Ordering::SeqCst);
    }

    /// Stops a node and tells the survivors.
    pub fn crash(&self, idx: NodeIdx) {
        self.net.down.lock().insert(idx);
        for (i, node) in self.nodes.iter().enumerate() {
            if i as NodeIdx != idx {
                node.manager.node_failed(idx);
            }
        }
    }

    /// Stops a node without anyone noticing.
    pub fn net_down_quietly(&self, idx: NodeIdx) {
        self.net.down.lock().insert(idx);
    }

    /// Replaces a crashed node by a fresh process over the same storage.
    pub fn restart(&mut self, idx: NodeIdx) -> usize {
        let storage = self.nodes[idx as usize].storage.clone();
        self.nodes[idx as usize] = Self::node(&self.net, idx, storage, &self.config);
        self.net.down.lock().remove(&idx);
        for node in &self.nodes {
            node.manager.node_recovered(idx);
        }
        self.manager(idx).recover().expect("recover")
    }
}
