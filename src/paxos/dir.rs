use std::collections::HashMap;

use tracing::debug;

use crate::{NodeId, NodeIdx};

/// Directory of nodes known to this process.
///
/// The transport speaks [`NodeId`]s; the consensus core only ever sees the
/// dense [`NodeIdx`] handles handed out here, in order of first sight.
#[derive(Debug, Default, Clone)]
pub struct NodeMap {
    nodes: Vec<NodeId>,
    handles: HashMap<NodeId, NodeIdx>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `id`, allocating one if it was never seen.
    pub fn remember(&mut self, id: NodeId) -> NodeIdx {
        if let Some(idx) = self.handles.get(&id) {
            return *idx;
        }
        let idx = self.nodes.len() as NodeIdx;
        self.nodes.push(id);
        self.handles.insert(id, idx);
        debug!(node = %id, idx, "remembered node");
        idx
    }

    pub fn idx_of(&self, id: &NodeId) -> Option<NodeIdx> {
        self.handles.get(id).copied()
    }

    pub fn node_of(&self, idx: NodeIdx) -> Option<NodeId> {
        self.nodes.get(idx as usize).copied()
    }

    /// Sorted, de-duplicated handles for a member list.
    pub fn members(&mut self, ids: &[NodeId]) -> Vec<NodeIdx> {
        let mut members = ids.iter().map(|id| self.remember(*id)).collect::<Vec<_>>();
        members.sort_unstable();
        members.dedup();
        members
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_stable() {
        let mut map = NodeMap::new();
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(map.remember(a), 0);
        assert_eq!(map.remember(b), 1);
        assert_eq!(map.remember(a), 0);
        assert_eq!(map.len(), 2);

        assert_eq!(map.idx_of(&b), Some(1));
        assert_eq!(map.node_of(0), Some(a));
        assert_eq!(map.node_of(5), None);
    }

    #[test]
    fn member_lists_are_sorted_sets() {
        let mut map = NodeMap::new();
        let ids = [NodeId::random(), NodeId::random(), NodeId::random()];
        map.remember(ids[2]);

        let members = map.members(&[ids[0], ids[2], ids[1], ids[0]]);
        assert_eq!(members, vec![0, 1, 2]);
        assert_eq!(map.idx_of(&ids[2]), Some(0));
    }
}
