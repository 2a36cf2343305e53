#![forbid(unsafe_code)]

//! Collapse and restore of single entries.
//!
//! The virtualizer owns the [`EntryRegistry`], the [`Codec`] and the
//! [`MemoryLedger`]; it is the only code that moves an entry between the
//! active and collapsed states. It never decides *when* to do so, that is
//! the scheduler's job.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Entry vanished before collapse | `Skipped(Vanished)`, nothing mutated |
//! | Entry has no content | `Skipped(EmptyContent)`, resources resumed |
//! | Adapter rejects a mutation | `Skipped(RenderFailed)`, content left live |
//! | Anchor parent gone at restore | `Abandoned`, stored content dropped |
//! | Stored content fails to decode | restored with empty content |

use ahash::{AHashMap, AHashSet};

use crate::adapter::{NodeId, RenderAdapter, RenderError};
use crate::codec::{self, Codec};
use crate::config::{CollapseStrategy, UnloaderConfig};
use crate::entry::Detachment;
use crate::registry::EntryRegistry;
use crate::stats::{Clock, ExtractedEntry, MemoryDataPoint, MemoryLedger, Stats, SystemClock};

/// Why a collapse request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Vanished,
    EmptyContent,
    RenderFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CollapseOutcome {
    Collapsed {
        /// Estimate added to saved bytes.
        estimate: u64,
        placeholder: NodeId,
    },
    AlreadyCollapsed,
    Untracked,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum RestoreOutcome {
    Restored {
        /// Placeholder that stood in for the entry; its handle is released.
        placeholder: Option<NodeId>,
    },
    NotCollapsed,
    Untracked,
    /// The anchor was gone; the entry stays out of the tree and its stored
    /// content is dropped.
    Abandoned { placeholder: Option<NodeId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreAllReport {
    pub restored: usize,
    pub abandoned: usize,
}

#[derive(Debug)]
pub struct Virtualizer {
    registry: EntryRegistry,
    codec: Codec,
    ledger: MemoryLedger,
    strategy: CollapseStrategy,
    /// Placeholder to entry, for detached entries only.
    placeholders: AHashMap<NodeId, NodeId>,
}

impl Virtualizer {
    #[must_use]
    pub fn new(config: &UnloaderConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: &UnloaderConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            registry: EntryRegistry::new(),
            codec: Codec::new(config.codec.clone()),
            ledger: MemoryLedger::with_clock(config.history_capacity, clock),
            strategy: config.strategy,
            placeholders: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntryRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    #[must_use]
    pub const fn strategy(&self) -> CollapseStrategy {
        self.strategy
    }

    #[must_use]
    pub const fn saved_bytes(&self) -> u64 {
        self.ledger.saved_bytes()
    }

    #[must_use]
    pub fn history(&self) -> Vec<MemoryDataPoint> {
        self.ledger.history()
    }

    pub fn record_sample(&mut self) {
        self.ledger.record_sample();
    }

    /// Entry a detached placeholder stands in for.
    #[must_use]
    pub fn entry_for_placeholder(&self, placeholder: NodeId) -> Option<NodeId> {
        self.placeholders.get(&placeholder).copied()
    }

    // -----------------------------------------------------------------------
    // Collapse
    // -----------------------------------------------------------------------

    pub fn collapse<A>(&mut self, dom: &mut A, node: NodeId) -> CollapseOutcome
    where
        A: RenderAdapter + ?Sized,
    {
        let Some(state) = self.registry.get(node) else {
            return CollapseOutcome::Untracked;
        };
        if state.is_collapsed {
            return CollapseOutcome::AlreadyCollapsed;
        }
        let Some(height) = dom.rendered_height(node) else {
            tracing::debug!(target: "unloader.virtualizer", %node, "collapse skipped: node vanished");
            return CollapseOutcome::Skipped(SkipReason::Vanished);
        };
        let height = if height.is_finite() { height.max(0.0) } else { 0.0 };

        let anchor = match self.strategy {
            CollapseStrategy::InPlace => None,
            CollapseStrategy::Detach => {
                let Some(parent) = dom.parent(node) else {
                    return CollapseOutcome::Skipped(SkipReason::Vanished);
                };
                Some(Detachment {
                    parent,
                    next_sibling: dom.next_sibling(node),
                })
            }
        };

        let deferred = dom.defer_resources(node);
        let markup = dom.inner_markup(node).unwrap_or_default();
        let stored = self.codec.serialize(&markup);
        if stored.data.is_empty() {
            let _ = dom.resume_resources(node);
            return CollapseOutcome::Skipped(SkipReason::EmptyContent);
        }
        let estimate = self.codec.estimate_size(&markup, dom.subtree_node_count(node));

        let placeholder = match mount_placeholder(dom, node, height, anchor.is_some()) {
            Ok(placeholder) => placeholder,
            Err(err) => {
                tracing::warn!(target: "unloader.virtualizer", %node, error = %err, "collapse failed");
                let _ = dom.resume_resources(node);
                return CollapseOutcome::Skipped(SkipReason::RenderFailed);
            }
        };

        if let Some(state) = self.registry.get_mut(node) {
            state.is_collapsed = true;
            state.stored_content = stored.data;
            state.is_compressed = stored.compressed;
            state.original_extent = height;
            state.detachment = anchor;
            state.placeholder = Some(placeholder);
            state.saved_estimate = estimate;
        }
        if anchor.is_some() {
            self.placeholders.insert(placeholder, node);
        }
        self.ledger.add(estimate);
        self.ledger.record_sample();

        tracing::debug!(
            target: "unloader.virtualizer",
            %node,
            %placeholder,
            height,
            estimate,
            deferred,
            compressed = stored.compressed,
            "collapsed entry"
        );
        CollapseOutcome::Collapsed {
            estimate,
            placeholder,
        }
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    pub fn restore<A>(&mut self, dom: &mut A, node: NodeId) -> RestoreOutcome
    where
        A: RenderAdapter + ?Sized,
    {
        let Some(state) = self.registry.get(node) else {
            return RestoreOutcome::Untracked;
        };
        if !state.is_collapsed || state.stored_content.is_empty() {
            return RestoreOutcome::NotCollapsed;
        }
        let placeholder = state.placeholder;
        let anchor = state.detachment;

        if let Some(anchor) = anchor
            && !dom.is_connected(anchor.parent)
        {
            tracing::warn!(
                target: "unloader.virtualizer",
                %node,
                parent = %anchor.parent,
                "restore abandoned: anchor parent left the document"
            );
            self.finish_restore(dom, node, placeholder);
            return RestoreOutcome::Abandoned { placeholder };
        }

        let markup = self.codec.deserialize(&state.stored_content, state.is_compressed);
        if markup.is_empty() {
            tracing::warn!(target: "unloader.virtualizer", %node, "stored content unavailable, restoring empty");
        }
        if let Err(err) = dom.set_inner_markup(node, &markup) {
            tracing::warn!(target: "unloader.virtualizer", %node, error = %err, "failed to rehydrate entry");
        }

        if let Some(anchor) = anchor
            && let Err(err) = reattach(dom, node, anchor, placeholder)
        {
            tracing::warn!(target: "unloader.virtualizer", %node, error = %err, "restore abandoned: reinsertion failed");
            let _ = dom.set_inner_markup(node, "");
            self.finish_restore(dom, node, placeholder);
            return RestoreOutcome::Abandoned { placeholder };
        }

        dom.set_size_hints(node, None);
        let resumed = dom.resume_resources(node);
        self.finish_restore(dom, node, placeholder);
        tracing::debug!(target: "unloader.virtualizer", %node, resumed, "restored entry");
        RestoreOutcome::Restored { placeholder }
    }

    fn finish_restore<A>(&mut self, dom: &mut A, node: NodeId, placeholder: Option<NodeId>)
    where
        A: RenderAdapter + ?Sized,
    {
        let mut estimate = 0;
        if let Some(state) = self.registry.get_mut(node) {
            estimate = state.saved_estimate;
            state.clear_collapse();
        }
        if let Some(placeholder) = placeholder {
            self.placeholders.remove(&placeholder);
            dom.release(placeholder);
        }
        self.ledger.sub(estimate);
        self.ledger.record_sample();
    }

    /// Restore every collapsed entry, returning the document to its natural
    /// fully-materialized state.
    pub fn restore_all<A>(&mut self, dom: &mut A) -> RestoreAllReport
    where
        A: RenderAdapter + ?Sized,
    {
        let mut report = RestoreAllReport::default();
        for node in self.registry.collapsed() {
            match self.restore(dom, node) {
                RestoreOutcome::Restored { .. } => report.restored += 1,
                RestoreOutcome::Abandoned { .. } => report.abandoned += 1,
                RestoreOutcome::NotCollapsed | RestoreOutcome::Untracked => {}
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    /// `(total, active, collapsed)` without touching the document.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        let collapsed = self.registry.iter().filter(|(_, s)| s.is_collapsed).count();
        let total = self.registry.len();
        (total, total - collapsed, collapsed)
    }

    #[must_use]
    pub fn stats<A>(&self, dom: &A) -> Stats
    where
        A: RenderAdapter + ?Sized,
    {
        let (total, active, collapsed) = self.counts();
        Stats {
            total,
            active,
            collapsed,
            saved_bytes: self.ledger.saved_bytes(),
            dom_node_count: dom.document_node_count(),
        }
    }

    /// Text of an entry regardless of its collapse state.
    ///
    /// Collapsed entries are read from stored content; nobody outside the
    /// virtualizer should look at `stored_content` directly.
    #[must_use]
    pub fn extract_content<A>(&self, dom: &A, node: NodeId) -> String
    where
        A: RenderAdapter + ?Sized,
    {
        match self.registry.get(node) {
            Some(state) if state.is_collapsed => {
                let markup = self.codec.deserialize(&state.stored_content, state.is_compressed);
                codec::markup_text(&markup)
            }
            _ => dom
                .text_content(node)
                .map(|text| codec::normalize_whitespace(&text))
                .unwrap_or_default(),
        }
    }

    /// Every tracked entry with its role and text, in tracking order.
    #[must_use]
    pub fn extract_all<A>(&self, dom: &A) -> Vec<ExtractedEntry>
    where
        A: RenderAdapter + ?Sized,
    {
        self.registry
            .iter()
            .map(|(node, state)| ExtractedEntry {
                role: state.role,
                content: self.extract_content(dom, node),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Drop placeholder mappings whose entry is untracked or no longer
    /// collapsed behind that placeholder. Returns how many were pruned.
    pub fn prune_orphans(&mut self) -> usize {
        let before = self.placeholders.len();
        let registry = &self.registry;
        self.placeholders.retain(|placeholder, entry| {
            registry
                .get(*entry)
                .is_some_and(|s| s.is_collapsed && s.placeholder == Some(*placeholder))
        });
        before - self.placeholders.len()
    }

    /// Every node the engine still needs a handle for: tracked entries, their
    /// placeholders and the anchors of detached entries.
    #[must_use]
    pub fn referenced_nodes(&self) -> AHashSet<NodeId> {
        let mut live = AHashSet::with_capacity(self.registry.len() + self.placeholders.len());
        for (node, state) in self.registry.iter() {
            live.insert(node);
            live.extend(state.placeholder);
            if let Some(anchor) = state.detachment {
                live.insert(anchor.parent);
                live.extend(anchor.next_sibling);
            }
        }
        live.extend(self.placeholders.keys().copied());
        live
    }

    /// Zero saved bytes and clear the history.
    pub fn reset_stats(&mut self) {
        self.ledger.reset();
    }

    /// Forget every entry. Callers restore first if the document survives.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.placeholders.clear();
        self.ledger.reset();
    }

    #[cfg(test)]
    pub(crate) fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    #[cfg(test)]
    pub(crate) fn insert_orphan_placeholder(&mut self, placeholder: NodeId, entry: NodeId) {
        self.placeholders.insert(placeholder, entry);
    }
}

fn mount_placeholder<A>(dom: &mut A, node: NodeId, height: f64, detach: bool) -> Result<NodeId, RenderError>
where
    A: RenderAdapter + ?Sized,
{
    let placeholder = dom.create_placeholder(height)?;
    let mounted = if detach {
        dom.replace_node(node, placeholder)
    } else {
        dom.replace_children(node, placeholder)
    };
    if let Err(err) = mounted {
        dom.release(placeholder);
        return Err(err);
    }
    if detach {
        // Off-tree now; drop the subtree so only the stored copy remains.
        if let Err(err) = dom.set_inner_markup(node, "") {
            tracing::debug!(target: "unloader.virtualizer", %node, error = %err, "detached node kept its children");
        }
    } else {
        dom.set_size_hints(node, Some(height));
    }
    Ok(placeholder)
}

fn reattach<A>(
    dom: &mut A,
    node: NodeId,
    anchor: Detachment,
    placeholder: Option<NodeId>,
) -> Result<(), RenderError>
where
    A: RenderAdapter + ?Sized,
{
    if let Some(placeholder) = placeholder
        && dom.is_connected(placeholder)
        && dom.parent(placeholder).is_some()
    {
        return dom.replace_node(placeholder, node);
    }
    let reference = anchor
        .next_sibling
        .filter(|sibling| dom.parent(*sibling) == Some(anchor.parent));
    dom.insert_before(anchor.parent, node, reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Role;
    use crate::memory::MemoryDocument;
    use crate::stats::ManualClock;

    fn setup(strategy: CollapseStrategy) -> (MemoryDocument, Virtualizer, Vec<NodeId>) {
        let mut doc = MemoryDocument::new();
        let main = doc.add_container("main");
        let nodes = vec![
            doc.add_entry(main, "user", "<p>first question</p>", 120.0),
            doc.add_entry(main, "assistant", "<p>An <b>answer</b> &amp; more</p>", 480.0),
            doc.add_entry(main, "user", "<p>follow up</p>", 90.0),
        ];
        let config = UnloaderConfig {
            strategy,
            ..UnloaderConfig::default()
        };
        let mut virtualizer = Virtualizer::with_clock(&config, Box::new(ManualClock::new(0)));
        for node in &nodes {
            let role = doc.attribute(*node, "data-message-author-role");
            let _ = virtualizer.registry_mut().track(*node, Role::from_attr(role.as_deref()));
        }
        (doc, virtualizer, nodes)
    }

    #[test]
    fn scenario_collapse_middle_entry() {
        for strategy in [CollapseStrategy::InPlace, CollapseStrategy::Detach] {
            let (mut doc, mut v, nodes) = setup(strategy);
            let before = v.extract_content(&doc, nodes[1]);
            assert!(matches!(v.collapse(&mut doc, nodes[1]), CollapseOutcome::Collapsed { .. }));
            let stats = v.stats(&doc);
            assert_eq!(stats.counts(), (3, 2, 1));
            assert!(stats.saved_bytes > 0);
            assert_eq!(v.extract_content(&doc, nodes[1]), before);
            assert_eq!(before, "An answer & more");
        }
    }

    #[test]
    fn collapse_is_idempotent() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        let _ = v.collapse(&mut doc, nodes[0]);
        let saved = v.saved_bytes();
        assert_eq!(v.collapse(&mut doc, nodes[0]), CollapseOutcome::AlreadyCollapsed);
        assert_eq!(v.saved_bytes(), saved);
        assert_eq!(v.history().len(), 1);
    }

    #[test]
    fn detach_removes_node_and_records_anchor() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        let CollapseOutcome::Collapsed { placeholder, .. } = v.collapse(&mut doc, nodes[1]) else {
            panic!("expected collapse");
        };
        assert!(!doc.is_connected(nodes[1]));
        assert!(doc.is_connected(placeholder));
        assert_eq!(doc.rendered_height(placeholder), Some(480.0));
        let state = v.registry().get(nodes[1]).unwrap();
        assert_eq!(
            state.detachment,
            Some(Detachment {
                parent: doc.parent(placeholder).unwrap(),
                next_sibling: Some(nodes[2]),
            })
        );
        assert_eq!(v.entry_for_placeholder(placeholder), Some(nodes[1]));

        assert_eq!(
            v.restore(&mut doc, nodes[1]),
            RestoreOutcome::Restored {
                placeholder: Some(placeholder)
            }
        );
        assert!(doc.is_connected(nodes[1]));
        assert_eq!(doc.next_sibling(nodes[0]), Some(nodes[1]));
        assert_eq!(v.saved_bytes(), 0);
        assert!(v.registry().get(nodes[1]).unwrap().detachment.is_none());
    }

    #[test]
    fn in_place_keeps_node_with_size_hints() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::InPlace);
        let _ = v.collapse(&mut doc, nodes[0]);
        assert!(doc.is_connected(nodes[0]));
        assert_eq!(doc.size_hint(nodes[0]), Some(120.0));
        assert_eq!(doc.text_content(nodes[0]).as_deref(), Some(""));
        let _ = v.restore(&mut doc, nodes[0]);
        assert_eq!(doc.size_hint(nodes[0]), None);
        assert_eq!(v.extract_content(&doc, nodes[0]), "first question");
    }

    #[test]
    fn zero_height_entry_gets_zero_height_placeholder() {
        let mut doc = MemoryDocument::new();
        let main = doc.add_container("main");
        let node = doc.add_entry(main, "assistant", "<p>hidden</p>", 0.0);
        let mut v = Virtualizer::new(&UnloaderConfig::default());
        let _ = v.registry_mut().track(node, Role::Assistant);
        let CollapseOutcome::Collapsed { placeholder, .. } = v.collapse(&mut doc, node) else {
            panic!("expected collapse");
        };
        assert_eq!(doc.rendered_height(placeholder), Some(0.0));
        assert_eq!(v.registry().get(node).unwrap().original_extent, 0.0);
    }

    #[test]
    fn empty_entry_is_not_collapsed() {
        let mut doc = MemoryDocument::new();
        let main = doc.add_container("main");
        let node = doc.add_entry(main, "assistant", "  <!-- streaming --> ", 10.0);
        let mut v = Virtualizer::new(&UnloaderConfig::default());
        let _ = v.registry_mut().track(node, Role::Assistant);
        assert_eq!(
            v.collapse(&mut doc, node),
            CollapseOutcome::Skipped(SkipReason::EmptyContent)
        );
        assert!(!v.registry().get(node).unwrap().is_collapsed);
    }

    #[test]
    fn untracked_and_vanished_entries_are_noops() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        assert_eq!(v.collapse(&mut doc, NodeId(999)), CollapseOutcome::Untracked);
        assert_eq!(v.restore(&mut doc, NodeId(999)), RestoreOutcome::Untracked);
        assert_eq!(v.restore(&mut doc, nodes[0]), RestoreOutcome::NotCollapsed);
        doc.remove(nodes[2]);
        assert_eq!(
            v.collapse(&mut doc, nodes[2]),
            CollapseOutcome::Skipped(SkipReason::Vanished)
        );
    }

    #[test]
    fn restore_abandons_when_anchor_parent_is_gone() {
        let mut doc = MemoryDocument::new();
        let main = doc.add_container("main");
        let turn = doc.add_group(main);
        let node = doc.add_entry(turn, "assistant", "<p>orphan</p>", 50.0);
        let mut v = Virtualizer::new(&UnloaderConfig::default());
        let _ = v.registry_mut().track(node, Role::Assistant);
        let _ = v.collapse(&mut doc, node);
        doc.remove(turn);

        assert!(matches!(v.restore(&mut doc, node), RestoreOutcome::Abandoned { .. }));
        assert!(!doc.is_connected(node));
        let state = v.registry().get(node).unwrap();
        assert!(!state.is_collapsed);
        assert_eq!(v.saved_bytes(), 0);
    }

    #[test]
    fn restore_falls_back_to_anchor_when_placeholder_removed() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        let CollapseOutcome::Collapsed { placeholder, .. } = v.collapse(&mut doc, nodes[1]) else {
            panic!("expected collapse");
        };
        doc.remove(placeholder);
        assert!(matches!(v.restore(&mut doc, nodes[1]), RestoreOutcome::Restored { .. }));
        assert_eq!(doc.next_sibling(nodes[1]), Some(nodes[2]));
    }

    #[test]
    fn corrupt_stored_content_restores_empty() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::InPlace);
        let _ = v.collapse(&mut doc, nodes[0]);
        if let Some(state) = v.registry_mut().get_mut(nodes[0]) {
            state.stored_content = "!!corrupt!!".into();
            state.is_compressed = true;
        }
        assert_eq!(v.extract_content(&doc, nodes[0]), "");
        assert!(matches!(v.restore(&mut doc, nodes[0]), RestoreOutcome::Restored { .. }));
        assert_eq!(v.saved_bytes(), 0);
    }

    #[test]
    fn images_are_deferred_while_collapsed() {
        let mut doc = MemoryDocument::new();
        let main = doc.add_container("main");
        let node = doc.add_entry(main, "user", r#"<p>see</p><img src="cat.png">"#, 200.0);
        let mut v = Virtualizer::new(&UnloaderConfig {
            strategy: CollapseStrategy::Detach,
            ..UnloaderConfig::default()
        });
        let _ = v.registry_mut().track(node, Role::User);
        let _ = v.collapse(&mut doc, node);
        let _ = v.restore(&mut doc, node);
        let markup = doc.inner_markup(node).unwrap();
        assert!(markup.contains(r#"src="cat.png""#));
        assert!(!markup.contains(crate::codec::DORMANT_SRC_ATTR));
    }

    #[test]
    fn restore_all_returns_to_baseline() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        for node in &nodes {
            let _ = v.collapse(&mut doc, *node);
        }
        let report = v.restore_all(&mut doc);
        assert_eq!(report, RestoreAllReport { restored: 3, abandoned: 0 });
        assert_eq!(v.stats(&doc).counts(), (3, 3, 0));
        assert_eq!(v.saved_bytes(), 0);
        assert_eq!(v.placeholder_count(), 0);
    }

    #[test]
    fn prune_orphans_drops_stale_mappings() {
        let (mut doc, mut v, nodes) = setup(CollapseStrategy::Detach);
        let _ = v.collapse(&mut doc, nodes[0]);
        v.insert_orphan_placeholder(NodeId(5000), NodeId(6000));
        v.insert_orphan_placeholder(NodeId(5001), nodes[2]);
        assert_eq!(v.prune_orphans(), 2);
        assert_eq!(v.placeholder_count(), 1);
    }
}
