//! Durable paxos state: promises, votes, decisions and checkpoints per group.
//!
//! Every `put_*` must be durable before it returns; callers reply to peers only
//! afterwards. [`MemoryStorage`] outlives the managers that use it, which is
//! enough to simulate a crash and restart. [`JournalStorage`] appends one JSON
//! record per line to a file per group and compacts the file on garbage
//! collection.

use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use itertools::Itertools;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Ballot, Decision, GroupId, PValue, Slot};
use crate::{NodeIdx, PaxosError};

/// Application state as of just before `next_to_execute`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_to_execute: Slot,
    pub state: Vec<u8>,
    /// Set when the stop request lies before `next_to_execute`.
    #[serde(default)]
    pub stopped: bool,
}

/// Everything persisted for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLog {
    pub members: Vec<NodeIdx>,
    pub promised: Option<Ballot>,
    pub accepted: BTreeMap<Slot, PValue>,
    pub decisions: BTreeMap<Slot, Decision>,
    pub checkpoint: Option<Checkpoint>,
    pub gc_slot: Option<Slot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JournalRecord {
    Group { group: GroupId, members: Vec<NodeIdx> },
    Promise { ballot: Ballot },
    Accepted { pvalue: PValue },
    Decision { decision: Decision },
    Checkpoint { checkpoint: Checkpoint },
    Gc { up_to: Slot },
}

impl GroupLog {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Group { members, .. } => self.members = members,
            JournalRecord::Promise { ballot } => {
                if self.promised.map_or(true, |b| ballot > b) {
                    self.promised = Some(ballot);
                }
            }
            JournalRecord::Accepted { pvalue } => {
                let newer = self
                    .accepted
                    .get(&pvalue.slot)
                    .map_or(true, |old| pvalue.ballot >= old.ballot);
                if newer {
                    self.accepted.insert(pvalue.slot, pvalue);
                }
            }
            JournalRecord::Decision { decision } => {
                self.accepted.remove(&decision.slot());
                self.decisions.insert(decision.slot(), decision);
            }
            JournalRecord::Checkpoint { checkpoint } => {
                if self
                    .checkpoint
                    .as_ref()
                    .map_or(true, |c| checkpoint.next_to_execute >= c.next_to_execute)
                {
                    self.checkpoint = Some(checkpoint);
                }
            }
            JournalRecord::Gc { up_to } => self.garbage_collect(up_to),
        }
    }

    /// Drops entries at or below `up_to`, but never past the checkpoint:
    /// decisions after it are what recovery replays.
    fn garbage_collect(&mut self, up_to: Slot) {
        let Some(covered) = self
            .checkpoint
            .as_ref()
            .and_then(|c| c.next_to_execute.checked_sub(1))
        else {
            return;
        };
        let up_to = up_to.min(covered);
        self.accepted = self.accepted.split_off(&(up_to + 1));
        self.decisions = self.decisions.split_off(&(up_to + 1));
        self.gc_slot = Some(self.gc_slot.map_or(up_to, |g| g.max(up_to)));
    }

    fn records(&self, group: &str) -> Vec<JournalRecord> {
        let mut out = vec![JournalRecord::Group {
            group: group.to_string(),
            members: self.members.clone(),
        }];
        out.extend(self.promised.map(|ballot| JournalRecord::Promise { ballot }));
        out.extend(self.checkpoint.clone().map(|checkpoint| JournalRecord::Checkpoint { checkpoint }));
        out.extend(self.accepted.values().cloned().map(|pvalue| JournalRecord::Accepted { pvalue }));
        out.extend(
            self.decisions
                .values()
                .cloned()
                .map(|decision| JournalRecord::Decision { decision }),
        );
        out.extend(self.gc_slot.map(|up_to| JournalRecord::Gc { up_to }));
        out
    }
}

/// Durable log used by every paxos instance of a node.
pub trait PaxosStorage: Send + Sync {
    fn put_group(&self, group: &str, members: &[NodeIdx]) -> Result<(), PaxosError>;

    fn put_promise(&self, group: &str, ballot: Ballot) -> Result<(), PaxosError>;

    fn put_accepted(&self, group: &str, pvalue: &PValue) -> Result<(), PaxosError>;

    fn put_decision(&self, group: &str, decision: &Decision) -> Result<(), PaxosError>;

    fn put_checkpoint(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PaxosError>;

    /// Forget entries at or below `up_to` that the latest checkpoint covers.
    fn garbage_collect(&self, group: &str, up_to: Slot) -> Result<(), PaxosError>;

    fn load(&self, group: &str) -> Result<Option<GroupLog>, PaxosError>;

    fn groups(&self) -> Result<Vec<GroupId>, PaxosError>;

    fn remove_group(&self, group: &str) -> Result<(), PaxosError>;
}

/// In-memory storage. Share it (`Arc`) between a crashed manager and its
/// replacement to exercise recovery.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    groups: Mutex<BTreeMap<GroupId, GroupLog>>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full or broken disk would.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn write(&self, group: &str, record: JournalRecord) -> Result<(), PaxosError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(PaxosError::Storage(format!("group {group}: storage is read-only")));
        }
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .apply(record);
        Ok(())
    }
}

impl PaxosStorage for MemoryStorage {
    fn put_group(&self, group: &str, members: &[NodeIdx]) -> Result<(), PaxosError> {
        self.write(
            group,
            JournalRecord::Group {
                group: group.to_string(),
                members: members.to_vec(),
            },
        )
    }

    fn put_promise(&self, group: &str, ballot: Ballot) -> Result<(), PaxosError> {
        self.write(group, JournalRecord::Promise { ballot })
    }

    fn put_accepted(&self, group: &str, pvalue: &PValue) -> Result<(), PaxosError> {
        self.write(group, JournalRecord::Accepted { pvalue: pvalue.clone() })
    }

    fn put_decision(&self, group: &str, decision: &Decision) -> Result<(), PaxosError> {
        self.write(group, JournalRecord::Decision { decision: decision.clone() })
    }

    fn put_checkpoint(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PaxosError> {
        self.write(group, JournalRecord::Checkpoint { checkpoint: checkpoint.clone() })
    }

    fn garbage_collect(&self, group: &str, up_to: Slot) -> Result<(), PaxosError> {
        self.write(group, JournalRecord::Gc { up_to })
    }

    fn load(&self, group: &str) -> Result<Option<GroupLog>, PaxosError> {
        Ok(self.groups.lock().get(group).cloned())
    }

    fn groups(&self) -> Result<Vec<GroupId>, PaxosError> {
        Ok(self.groups.lock().keys().cloned().collect())
    }

    fn remove_group(&self, group: &str) -> Result<(), PaxosError> {
        self.groups.lock().remove(group);
        Ok(())
    }
}

struct Journal {
    file: File,
    log: GroupLog,
}

/// One append-only JSON-lines file per group under a directory.
pub struct JournalStorage {
    dir: PathBuf,
    journals: Mutex<HashMap<GroupId, Journal>>,
}

impl JournalStorage {
    /// Opens `dir`, replaying every journal found in it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PaxosError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut journals = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some((group, log, torn)) = Self::replay(&path)? {
                let file = if torn {
                    rewrite(&path, &log.records(&group))?
                } else {
                    OpenOptions::new().append(true).open(&path)?
                };
                journals.insert(group, Journal { file, log });
            }
        }
        debug!(dir = %dir.display(), groups = journals.len(), "opened paxos journal");

        Ok(Self {
            dir,
            journals: Mutex::new(journals),
        })
    }

    /// Returns the group, its state, and whether the file ended in a torn record.
    fn replay(path: &Path) -> Result<Option<(GroupId, GroupLog, bool)>, PaxosError> {
        let reader = BufReader::new(File::open(path)?);
        let mut group = None;
        let mut log = GroupLog::default();
        let mut torn = false;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) => {
                    if let JournalRecord::Group { group: g, .. } = &record {
                        group = Some(g.clone());
                    }
                    log.apply(record);
                }
                Err(err) => {
                    // A crash mid-append leaves a torn last record.
                    warn!(path = %path.display(), error = %err, "ignoring torn journal tail");
                    torn = true;
                    break;
                }
            }
        }
        Ok(group.map(|g| (g, log, torn)))
    }

    fn path_for(&self, group: &str) -> PathBuf {
        let name = group.bytes().map(|b| format!("{b:02x}")).join("");
        self.dir.join(format!("{name}.log"))
    }

    fn append(&self, group: &str, record: JournalRecord) -> Result<(), PaxosError> {
        let mut journals = self.journals.lock();
        let journal = match journals.entry(group.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path_for(group))?;
                entry.insert(Journal {
                    file,
                    log: GroupLog::default(),
                })
            }
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        journal.file.write_all(&line)?;
        journal.file.sync_data()?;
        journal.log.apply(record);
        Ok(())
    }

    /// Rewrites the group's journal with only what is still live.
    fn compact(&self, group: &str, journal: &mut Journal) -> Result<(), PaxosError> {
        journal.file = rewrite(&self.path_for(group), &journal.log.records(group))?;
        Ok(())
    }
}

/// Atomically replaces `path` with `records`; returns an append handle to it.
fn rewrite(path: &Path, records: &[JournalRecord]) -> Result<File, PaxosError> {
    let tmp = path.with_extension("compact");
    {
        let mut file = File::create(&tmp)?;
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(OpenOptions::new().append(true).open(path)?)
}

impl PaxosStorage for JournalStorage {
    fn put_group(&self, group: &str, members: &[NodeIdx]) -> Result<(), PaxosError> {
        self.append(
            group,
            JournalRecord::Group {
                group: group.to_string(),
                members: members.to_vec(),
            },
        )
    }

    fn put_promise(&self, group: &str, ballot: Ballot) -> Result<(), PaxosError> {
        self.append(group, JournalRecord::Promise { ballot })
    }

    fn put_accepted(&self, group: &str, pvalue: &PValue) -> Result<(), PaxosError> {
        self.append(group, JournalRecord::Accepted { pvalue: pvalue.clone() })
    }

    fn put_decision(&self, group: &str, decision: &Decision) -> Result<(), PaxosError> {
        self.append(group, JournalRecord::Decision { decision: decision.clone() })
    }

    fn put_checkpoint(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PaxosError> {
        self.append(group, JournalRecord::Checkpoint { checkpoint: checkpoint.clone() })
    }

    fn garbage_collect(&self, group: &str, up_to: Slot) -> Result<(), PaxosError> {
        let mut journals = self.journals.lock();
        let Some(journal) = journals.get_mut(group) else {
            return Ok(());
        };
        let before = journal.log.decisions.len() + journal.log.accepted.len();
        journal.log.apply(JournalRecord::Gc { up_to });
        if journal.log.decisions.len() + journal.log.accepted.len() < before {
            self.compact(group, journal)?;
        }
        Ok(())
    }

    fn load(&self, group: &str) -> Result<Option<GroupLog>, PaxosError> {
        Ok(self.journals.lock().get(group).map(|j| j.log.clone()))
    }

    fn groups(&self) -> Result<Vec<GroupId>, PaxosError> {
        Ok(self.journals.lock().keys().cloned().sorted().collect())
    }

    fn remove_group(&self, group: &str) -> Result<(), PaxosError> {
        if self.journals.lock().remove(group).is_some() {
            fs::remove_file(self.path_for(group))?;
        }
        Ok(())
    }
}
