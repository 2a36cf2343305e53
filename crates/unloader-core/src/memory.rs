#![forbid(unsafe_code)]

//! In-memory host for deterministic tests.
//!
//! [`MemoryDocument`] models just enough of a render tree: structural nodes
//! (root, containers, groups, entries, placeholders) with parent/child links,
//! and a leaf markup string per node standing in for the entry's rendered
//! content. [`RecordingHost`] records every observer command and keeps the
//! current observer state so tests can assert on it and replay callbacks.

use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ahash::AHashMap;

use crate::adapter::{
    NodeId, ObserverHost, ObserverKind, PLACEHOLDER_ATTR, RenderAdapter, RenderError,
    ViewportMargin,
};
use crate::codec;
use crate::scheduler::Generation;

#[derive(Debug, Clone)]
struct MemNode {
    tag: String,
    attrs: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    markup: String,
    height: f64,
    size_hint: Option<f64>,
}

impl MemNode {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            attrs: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
            markup: String::new(),
            height: 0.0,
            size_hint: None,
        }
    }
}

/// Arena-backed render tree.
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    nodes: AHashMap<NodeId, MemNode>,
    root: NodeId,
    next_id: u64,
    entry_attribute: String,
    container_tags: Vec<String>,
    reclaim_requests: usize,
    fail_reclaim: bool,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    /// Empty document with an `html` root and no container.
    #[must_use]
    pub fn new() -> Self {
        let root = NodeId(1);
        let mut nodes = AHashMap::new();
        nodes.insert(root, MemNode::new("html"));
        Self {
            nodes,
            root,
            next_id: 2,
            entry_attribute: "data-message-author-role".to_owned(),
            container_tags: vec!["main".to_owned()],
            reclaim_requests: 0,
            fail_reclaim: false,
        }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    fn alloc(&mut self, node: MemNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
    }

    fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.nodes.get(&node).and_then(|n| n.parent) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != node);
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = None;
        }
    }

    /// Append a container element (e.g. `main`) under the root.
    pub fn add_container(&mut self, tag: &str) -> NodeId {
        let id = self.alloc(MemNode::new(tag));
        self.append(self.root, id);
        id
    }

    /// Append a plain grouping element under `parent`.
    pub fn add_group(&mut self, parent: NodeId) -> NodeId {
        let id = self.alloc(MemNode::new("div"));
        self.append(parent, id);
        id
    }

    /// Create an unattached grouping element (an inserted fragment root).
    pub fn new_group(&mut self) -> NodeId {
        self.alloc(MemNode::new("div"))
    }

    /// Append an entry with the given role, content markup and height.
    pub fn add_entry(&mut self, parent: NodeId, role: &str, markup: &str, height: f64) -> NodeId {
        let mut node = MemNode::new("div");
        node.attrs
            .insert(self.entry_attribute.clone(), role.to_owned());
        node.attrs.insert("class".to_owned(), "group/turn".to_owned());
        node.markup = markup.to_owned();
        node.height = height;
        let id = self.alloc(node);
        self.append(parent, id);
        id
    }

    /// Attach an existing node under `parent`.
    pub fn attach(&mut self, parent: NodeId, node: NodeId) {
        self.append(parent, node);
    }

    /// Remove a node from the tree as the host page would.
    pub fn remove(&mut self, node: NodeId) {
        self.detach(node);
    }

    pub fn set_height(&mut self, node: NodeId, height: f64) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.height = height;
        }
    }

    #[must_use]
    pub fn size_hint(&self, node: NodeId) -> Option<f64> {
        self.nodes.get(&node).and_then(|n| n.size_hint)
    }

    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    #[must_use]
    pub fn is_placeholder(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|n| n.attrs.contains_key(PLACEHOLDER_ATTR))
    }

    #[must_use]
    pub const fn reclaim_requests(&self) -> usize {
        self.reclaim_requests
    }

    /// Make [`RenderAdapter::request_memory_reclaim`] fail.
    pub fn set_fail_reclaim(&mut self, fail: bool) {
        self.fail_reclaim = fail;
    }

    fn serialize_children(&self, node: &MemNode, out: &mut String) {
        out.push_str(&node.markup);
        for child in &node.children {
            let Some(c) = self.nodes.get(child) else { continue };
            out.push('<');
            out.push_str(&c.tag);
            for (name, value) in &c.attrs {
                out.push_str(&format!(" {name}=\"{value}\""));
            }
            out.push('>');
            self.serialize_children(c, out);
            out.push_str(&format!("</{}>", c.tag));
        }
    }

    fn text_of(&self, node: &MemNode, out: &mut String) {
        out.push_str(&codec::markup_text(&node.markup));
        for child in &node.children {
            if let Some(c) = self.nodes.get(child) {
                self.text_of(c, out);
            }
        }
    }

    fn count_elements(&self, node: &MemNode) -> usize {
        let in_markup = node
            .markup
            .match_indices('<')
            .filter(|(i, _)| {
                node.markup[i + 1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
            })
            .count();
        1 + in_markup
            + node
                .children
                .iter()
                .filter_map(|c| self.nodes.get(c))
                .map(|c| self.count_elements(c))
                .sum::<usize>()
    }

    fn collect_entries(&self, node: NodeId, out: &mut Vec<NodeId>) {
        let Some(n) = self.nodes.get(&node) else { return };
        if n.attrs.contains_key(&self.entry_attribute) {
            out.push(node);
        }
        for child in &n.children {
            self.collect_entries(*child, out);
        }
    }

    fn rewrite_markup(&mut self, node: NodeId, f: fn(&str) -> (String, usize)) -> usize {
        let Some(n) = self.nodes.get_mut(&node) else { return 0 };
        let (markup, count) = f(&n.markup);
        n.markup = markup;
        count
    }
}

impl RenderAdapter for MemoryDocument {
    fn find_container(&self) -> Option<NodeId> {
        let mut stack = vec![self.root];
        let mut found = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(n) = self.nodes.get(&id) else { continue };
            if self.container_tags.iter().any(|t| *t == n.tag) {
                found.push(id);
            }
            stack.extend(n.children.iter().rev());
        }
        self.container_tags.iter().find_map(|tag| {
            found
                .iter()
                .copied()
                .find(|id| self.nodes.get(id).is_some_and(|n| &n.tag == tag))
        })
    }

    fn entries_within(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_entries(root, &mut out);
        out
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.nodes.get(&node).and_then(|n| n.attrs.get(name).cloned())
    }

    fn rendered_height(&self, node: NodeId) -> Option<f64> {
        if !self.is_connected(node) {
            return None;
        }
        let n = self.nodes.get(&node)?;
        Some(n.size_hint.unwrap_or(n.height))
    }

    fn inner_markup(&self, node: NodeId) -> Option<String> {
        let n = self.nodes.get(&node)?;
        let mut out = String::new();
        self.serialize_children(n, &mut out);
        Some(out)
    }

    fn text_content(&self, node: NodeId) -> Option<String> {
        let n = self.nodes.get(&node)?;
        let mut out = String::new();
        self.text_of(n, &mut out);
        Some(out)
    }

    fn subtree_node_count(&self, node: NodeId) -> usize {
        self.nodes.get(&node).map_or(0, |n| self.count_elements(n))
    }

    fn document_node_count(&self) -> usize {
        self.subtree_node_count(self.root)
    }

    fn is_connected(&self, node: NodeId) -> bool {
        let mut current = node;
        loop {
            if current == self.root {
                return true;
            }
            match self.nodes.get(&current).and_then(|n| n.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.parent(node)?;
        let siblings = &self.nodes.get(&parent)?.children;
        let idx = siblings.iter().position(|c| *c == node)?;
        siblings.get(idx + 1).copied()
    }

    fn create_placeholder(&mut self, height: f64) -> Result<NodeId, RenderError> {
        let mut node = MemNode::new("div");
        node.attrs.insert(PLACEHOLDER_ATTR.to_owned(), String::new());
        node.height = height;
        Ok(self.alloc(node))
    }

    fn set_inner_markup(&mut self, node: NodeId, markup: &str) -> Result<(), RenderError> {
        let children = self
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .ok_or(RenderError::MissingNode(node))?;
        for child in children {
            self.detach(child);
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.markup = markup.to_owned();
        }
        Ok(())
    }

    fn replace_children(&mut self, node: NodeId, child: NodeId) -> Result<(), RenderError> {
        if !self.nodes.contains_key(&child) {
            return Err(RenderError::MissingNode(child));
        }
        self.set_inner_markup(node, "")?;
        self.append(node, child);
        Ok(())
    }

    fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<(), RenderError> {
        if !self.nodes.contains_key(&new) {
            return Err(RenderError::MissingNode(new));
        }
        let parent = self
            .nodes
            .get(&old)
            .ok_or(RenderError::MissingNode(old))?
            .parent
            .ok_or(RenderError::Detached(old))?;
        self.detach(new);
        let Some(p) = self.nodes.get_mut(&parent) else {
            return Err(RenderError::MissingNode(parent));
        };
        let Some(idx) = p.children.iter().position(|c| *c == old) else {
            return Err(RenderError::Detached(old));
        };
        p.children[idx] = new;
        if let Some(o) = self.nodes.get_mut(&old) {
            o.parent = None;
        }
        if let Some(n) = self.nodes.get_mut(&new) {
            n.parent = Some(parent);
        }
        Ok(())
    }

    fn insert_before(
        &mut self,
        parent: NodeId,
        node: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), RenderError> {
        if !self.nodes.contains_key(&node) {
            return Err(RenderError::MissingNode(node));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(RenderError::MissingNode(parent));
        }
        self.detach(node);
        let p = self
            .nodes
            .get_mut(&parent)
            .ok_or(RenderError::MissingNode(parent))?;
        let idx = match reference {
            Some(r) => p
                .children
                .iter()
                .position(|c| *c == r)
                .ok_or_else(|| RenderError::Host(format!("{r} is not a child of {parent}")))?,
            None => p.children.len(),
        };
        p.children.insert(idx, node);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = Some(parent);
        }
        Ok(())
    }

    fn release(&mut self, node: NodeId) {
        self.detach(node);
        self.nodes.remove(&node);
    }

    fn release_detached(&mut self, keep: &dyn Fn(NodeId) -> bool) -> usize {
        let doomed: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| !self.is_connected(*id) && !keep(*id))
            .collect();
        for id in &doomed {
            self.detach(*id);
            if let Some(node) = self.nodes.remove(id) {
                for child in node.children {
                    if let Some(c) = self.nodes.get_mut(&child) {
                        c.parent = None;
                    }
                }
            }
        }
        doomed.len()
    }

    fn set_size_hints(&mut self, node: NodeId, height: Option<f64>) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.size_hint = height;
        }
    }

    fn defer_resources(&mut self, node: NodeId) -> usize {
        self.rewrite_markup(node, codec::defer_sources)
    }

    fn resume_resources(&mut self, node: NodeId) -> usize {
        self.rewrite_markup(node, codec::resume_sources)
    }

    fn request_memory_reclaim(&mut self) -> Result<(), RenderError> {
        self.reclaim_requests += 1;
        if self.fail_reclaim {
            return Err(RenderError::Host("memory reclaim unavailable".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording observer host
// ---------------------------------------------------------------------------

/// One call made by the engine into its [`ObserverHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Connect {
        kind: ObserverKind,
        generation: Generation,
        margin: ViewportMargin,
    },
    Disconnect(ObserverKind),
    Observe(ObserverKind, NodeId),
    Unobserve(ObserverKind, NodeId),
    WatchMutations(NodeId),
    StopWatchingMutations,
    RequestIdle(Generation),
    StartMaintenance(Duration),
    CancelMaintenance,
}

#[derive(Debug, Clone, Default)]
struct ObserverRecord {
    connection: Option<(Generation, ViewportMargin)>,
    targets: BTreeSet<NodeId>,
}

/// [`ObserverHost`] that records calls and tracks live observer state.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    calls: Vec<HostCall>,
    primary: ObserverRecord,
    placeholder: ObserverRecord,
    watching: Option<NodeId>,
    idle: VecDeque<Generation>,
    maintenance: Option<Duration>,
}

impl RecordingHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, kind: ObserverKind) -> &ObserverRecord {
        match kind {
            ObserverKind::Primary => &self.primary,
            ObserverKind::Placeholder => &self.placeholder,
        }
    }

    fn record_mut(&mut self, kind: ObserverKind) -> &mut ObserverRecord {
        match kind {
            ObserverKind::Primary => &mut self.primary,
            ObserverKind::Placeholder => &mut self.placeholder,
        }
    }

    #[must_use]
    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Generation of the live observer, `None` when disconnected.
    #[must_use]
    pub fn generation(&self, kind: ObserverKind) -> Option<Generation> {
        self.record(kind).connection.map(|(g, _)| g)
    }

    #[must_use]
    pub fn margin(&self, kind: ObserverKind) -> Option<ViewportMargin> {
        self.record(kind).connection.map(|(_, m)| m)
    }

    #[must_use]
    pub fn observed(&self, kind: ObserverKind) -> Vec<NodeId> {
        self.record(kind).targets.iter().copied().collect()
    }

    #[must_use]
    pub fn is_observing(&self, kind: ObserverKind, node: NodeId) -> bool {
        self.record(kind).targets.contains(&node)
    }

    #[must_use]
    pub const fn watching(&self) -> Option<NodeId> {
        self.watching
    }

    /// Pop the oldest pending idle request.
    pub fn take_idle(&mut self) -> Option<Generation> {
        self.idle.pop_front()
    }

    #[must_use]
    pub fn pending_idle(&self) -> usize {
        self.idle.len()
    }

    #[must_use]
    pub const fn maintenance(&self) -> Option<Duration> {
        self.maintenance
    }
}

impl ObserverHost for RecordingHost {
    fn connect(&mut self, kind: ObserverKind, generation: Generation, margin: ViewportMargin) {
        self.calls.push(HostCall::Connect {
            kind,
            generation,
            margin,
        });
        let record = self.record_mut(kind);
        record.connection = Some((generation, margin));
        record.targets.clear();
    }

    fn disconnect(&mut self, kind: ObserverKind) {
        self.calls.push(HostCall::Disconnect(kind));
        let record = self.record_mut(kind);
        record.connection = None;
        record.targets.clear();
    }

    fn observe(&mut self, kind: ObserverKind, target: NodeId) {
        self.calls.push(HostCall::Observe(kind, target));
        let record = self.record_mut(kind);
        if record.connection.is_some() {
            record.targets.insert(target);
        }
    }

    fn unobserve(&mut self, kind: ObserverKind, target: NodeId) {
        self.calls.push(HostCall::Unobserve(kind, target));
        self.record_mut(kind).targets.remove(&target);
    }

    fn watch_mutations(&mut self, container: NodeId) {
        self.calls.push(HostCall::WatchMutations(container));
        self.watching = Some(container);
    }

    fn stop_watching_mutations(&mut self) {
        self.calls.push(HostCall::StopWatchingMutations);
        self.watching = None;
    }

    fn request_idle(&mut self, generation: Generation) {
        self.calls.push(HostCall::RequestIdle(generation));
        self.idle.push_back(generation);
    }

    fn start_maintenance(&mut self, interval: Duration) {
        self.calls.push(HostCall::StartMaintenance(interval));
        self.maintenance = Some(interval);
    }

    fn cancel_maintenance(&mut self) {
        self.calls.push(HostCall::CancelMaintenance);
        self.maintenance = None;
    }
}
