//! Runs a three-node group in one process, nodes talking over channels.
//!
//! ```sh
//! RUST_LOG=gigapaxos=debug cargo r --bin paxos_processes
//! ```
//!
//! Writes a few name records, fails the coordinator, writes some more through
//! its successor, then stops and deletes the group.

use std::{
    collections::BTreeMap,
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use gigapaxos::{
    paxos::{
        dir::NodeMap, manager::PaxosManager, storage::MemoryStorage, BoxError, Messenger, PaxosPacket, Replicable,
        RequestPacket, Slot,
    },
    NodeId, NodeIdx, PaxosConfig,
};
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const GROUP: &str = "names";

/// Name records of every group, `key=value` requests.
#[derive(Default)]
struct NameStore {
    groups: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl Replicable for NameStore {
    fn apply_decision(&self, group: &str, _slot: Slot, request: &RequestPacket) -> Result<(), BoxError> {
        if request.stop {
            return Ok(());
        }
        let text = std::str::from_utf8(&request.value)?;
        let (name, value) = text.split_once('=').ok_or("expected name=value")?;
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn get_state(&self, group: &str) -> Option<Vec<u8>> {
        let groups = self.groups.lock();
        serde_json::to_vec(&groups.get(group).cloned().unwrap_or_default()).ok()
    }

    fn put_state(&self, group: &str, state: &[u8]) -> Result<(), BoxError> {
        let records = serde_json::from_slice(state)?;
        self.groups.lock().insert(group.to_string(), records);
        Ok(())
    }
}

/// Delivers encoded packets to the other nodes' inboxes.
struct Channels {
    inboxes: Vec<Sender<Vec<u8>>>,
    down: Arc<Vec<AtomicBool>>,
}

impl Messenger for Channels {
    fn send(&self, to: NodeIdx, packet: &PaxosPacket) {
        if self.down[to as usize].load(Ordering::SeqCst) {
            return;
        }
        match packet.encode() {
            Ok(buf) => {
                let _ = self.inboxes[to as usize].send(buf);
            }
            Err(e) => warn!(error = %e, "failed to encode packet"),
        }
    }
}

fn run(manager: Arc<PaxosManager>, inbox: Receiver<Vec<u8>>, down: Arc<Vec<AtomicBool>>, done: Arc<AtomicBool>) {
    let me = manager.me() as usize;
    while !done.load(Ordering::SeqCst) {
        match inbox.recv_timeout(Duration::from_millis(50)) {
            Ok(_) if down[me].load(Ordering::SeqCst) => {}
            Ok(buf) => manager.handle_bytes(&buf),
            Err(RecvTimeoutError::Timeout) if !down[me].load(Ordering::SeqCst) => manager.tick(Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn show(managers: &[Arc<PaxosManager>], stores: &[Arc<NameStore>]) {
    for (manager, store) in managers.iter().zip(stores) {
        let records = store.groups.lock().get(GROUP).cloned().unwrap_or_default();
        match manager.status(GROUP) {
            Some(status) => info!(
                node = manager.me(),
                next_to_execute = status.next_to_execute,
                ballot = %status.ballot,
                coordinating = status.coordinating,
                ?records,
                "state"
            ),
            None => info!(node = manager.me(), ?records, "no instance"),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut nodes = NodeMap::new();
    let ids = [NodeId::random(), NodeId::random(), NodeId::random()];
    let members = nodes.members(&ids);
    for id in &ids {
        info!(node = %id, idx = ?nodes.idx_of(id), "node");
    }

    let done = Arc::new(AtomicBool::new(false));
    let down = Arc::new(members.iter().map(|_| AtomicBool::new(false)).collect::<Vec<_>>());
    let (senders, receivers): (Vec<_>, Vec<_>) = members.iter().map(|_| mpsc::channel()).unzip();

    let mut managers = vec![];
    let mut stores = vec![];
    let mut handles = vec![];
    for (idx, inbox) in members.iter().zip(receivers) {
        let store = Arc::new(NameStore::default());
        let manager = Arc::new(PaxosManager::new(
            *idx,
            PaxosConfig::default(),
            store.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(Channels {
                inboxes: senders.clone(),
                down: down.clone(),
            }),
        ));
        manager.create_group(GROUP, &members, None)?;

        let (m, d, f) = (manager.clone(), down.clone(), done.clone());
        handles.push(thread::spawn(move || run(m, inbox, d, f)));
        managers.push(manager);
        stores.push(store);
    }
    drop(senders);

    for (i, record) in ["alice=10.0.0.1", "bob=10.0.0.2", "carol=10.0.0.3"].iter().enumerate() {
        managers[1].propose(GROUP, RequestPacket::new(i as u64, 1, *record))?;
    }
    thread::sleep(Duration::from_millis(500));
    show(&managers, &stores);

    info!(node = members[0], "failing the coordinator");
    down[0].store(true, Ordering::SeqCst);
    for manager in &managers[1..] {
        manager.node_failed(members[0]);
    }
    thread::sleep(Duration::from_millis(300));

    managers[2].propose(GROUP, RequestPacket::new(10, 2, "dave=10.0.0.4"))?;
    managers[2].propose(GROUP, RequestPacket::new(11, 2, "alice=10.0.0.9"))?;
    thread::sleep(Duration::from_millis(500));
    show(&managers, &stores);

    managers[1].propose(GROUP, RequestPacket::stop(12, 2))?;
    thread::sleep(Duration::from_millis(500));
    for manager in &managers[1..] {
        match manager.delete_group(GROUP) {
            Ok(()) => info!(node = manager.me(), "group deleted"),
            Err(e) => warn!(node = manager.me(), error = %e, "group not deleted"),
        }
    }

    done.store(true, Ordering::SeqCst);
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
