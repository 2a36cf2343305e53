#![forbid(unsafe_code)]

//! Entry registry: node handle to [`EntryState`].
//!
//! Pure bookkeeping. The registry never touches the render tree. Iteration
//! order is insertion order, which for discovered entries is document order.

use ahash::AHashMap;

use crate::adapter::NodeId;
use crate::entry::{EntryState, Role};

/// Result of [`EntryRegistry::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum TrackOutcome {
    Tracked,
    AlreadyTracked,
}

#[derive(Debug, Default, Clone)]
pub struct EntryRegistry {
    states: AHashMap<NodeId, EntryState>,
    order: Vec<NodeId>,
}

impl EntryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` with a fresh active state. Idempotent.
    pub fn track(&mut self, node: NodeId, role: Role) -> TrackOutcome {
        if self.states.contains_key(&node) {
            return TrackOutcome::AlreadyTracked;
        }
        self.states.insert(node, EntryState::new(role));
        self.order.push(node);
        TrackOutcome::Tracked
    }

    #[must_use]
    pub fn is_tracked(&self, node: NodeId) -> bool {
        self.states.contains_key(&node)
    }

    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&EntryState> {
        self.states.get(&node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut EntryState> {
        self.states.get_mut(&node)
    }

    /// Iterate tracked entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &EntryState)> + '_ {
        self.order
            .iter()
            .filter_map(|node| self.states.get(node).map(|state| (*node, state)))
    }

    /// Owned copy of the tracked handles, safe to walk while mutating states.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Handles of entries currently collapsed.
    #[must_use]
    pub fn collapsed(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, state)| state.is_collapsed)
            .map(|(node, _)| node)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop everything. Only used on full teardown.
    pub fn clear(&mut self) {
        self.states.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_is_idempotent() {
        let mut registry = EntryRegistry::new();
        assert_eq!(registry.track(NodeId(1), Role::User), TrackOutcome::Tracked);
        assert_eq!(
            registry.track(NodeId(1), Role::Assistant),
            TrackOutcome::AlreadyTracked
        );
        assert_eq!(registry.len(), 1);
        // The first registration wins.
        assert_eq!(registry.get(NodeId(1)).unwrap().role, Role::User);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut registry = EntryRegistry::new();
        for id in [5, 2, 9] {
            let _ = registry.track(NodeId(id), Role::Unknown);
        }
        let order: Vec<u64> = registry.iter().map(|(node, _)| node.0).collect();
        assert_eq!(order, vec![5, 2, 9]);
    }

    #[test]
    fn snapshot_survives_mutation() {
        let mut registry = EntryRegistry::new();
        let _ = registry.track(NodeId(1), Role::User);
        let _ = registry.track(NodeId(2), Role::Assistant);
        for node in registry.snapshot() {
            registry.get_mut(node).unwrap().is_collapsed = true;
        }
        assert_eq!(registry.collapsed(), vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn clear_drops_everything() {
        let mut registry = EntryRegistry::new();
        let _ = registry.track(NodeId(1), Role::User);
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.is_tracked(NodeId(1)));
        assert_eq!(registry.iter().count(), 0);
    }
}
