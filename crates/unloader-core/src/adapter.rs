#![forbid(unsafe_code)]

//! Seams between the engine and its host.
//!
//! [`RenderAdapter`] covers every read and write against the render tree.
//! [`ObserverHost`] covers the host-owned machinery that produces events:
//! the two visibility observers, the mutation watcher, idle callbacks and the
//! maintenance timer. Both are implemented by `unloader-web` for the browser
//! and by [`crate::memory`] for tests.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::Generation;

/// Marker attribute carried by every placeholder the engine mounts.
pub const PLACEHOLDER_ATTR: &str = "data-unloader-placeholder";

/// Opaque handle to a node in the host render tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Render adapter failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The node handle does not resolve to a live node.
    MissingNode(NodeId),
    /// The node exists but is not attached where the operation needs it.
    Detached(NodeId),
    /// The host rejected the operation.
    Host(String),
}

impl core::fmt::Display for RenderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MissingNode(node) => write!(f, "node {node} does not exist"),
            Self::Detached(node) => write!(f, "node {node} is not attached"),
            Self::Host(msg) => write!(f, "host error: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {}

/// Narrow view of the host render tree.
///
/// Reads return `None` (or `0`) when a node has vanished; callers treat that
/// as transient absence rather than failure.
pub trait RenderAdapter {
    /// Locate the transcript container, if the page has one yet.
    fn find_container(&self) -> Option<NodeId>;

    /// Every entry node at or below `root`, in document order.
    fn entries_within(&self, root: NodeId) -> Vec<NodeId>;

    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Current rendered height in CSS pixels.
    fn rendered_height(&self, node: NodeId) -> Option<f64>;

    /// Serialized markup of the node's children.
    fn inner_markup(&self, node: NodeId) -> Option<String>;

    /// Concatenated text of the node's subtree.
    fn text_content(&self, node: NodeId) -> Option<String>;

    /// Number of element nodes in the subtree, including `node`.
    fn subtree_node_count(&self, node: NodeId) -> usize;

    /// Number of element nodes in the whole document.
    fn document_node_count(&self) -> usize;

    /// Whether the node is reachable from the document root.
    fn is_connected(&self, node: NodeId) -> bool;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn next_sibling(&self, node: NodeId) -> Option<NodeId>;

    /// Create an unattached placeholder of fixed height.
    fn create_placeholder(&mut self, height: f64) -> Result<NodeId, RenderError>;

    /// Replace the node's children with parsed `markup`.
    fn set_inner_markup(&mut self, node: NodeId, markup: &str) -> Result<(), RenderError>;

    /// Replace all of the node's children with `child`.
    fn replace_children(&mut self, node: NodeId, child: NodeId) -> Result<(), RenderError>;

    /// Put `new` where `old` currently sits; `old` leaves the tree.
    fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<(), RenderError>;

    /// Insert `node` under `parent` before `reference` (append when `None`).
    fn insert_before(
        &mut self,
        parent: NodeId,
        node: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), RenderError>;

    /// Drop the adapter's handle for a node the engine no longer needs.
    fn release(&mut self, node: NodeId);

    /// Forget every handle whose node has left the document, except those
    /// `keep` claims. Connected nodes are never touched. Returns how many
    /// handles were dropped.
    fn release_detached(&mut self, keep: &dyn Fn(NodeId) -> bool) -> usize;

    /// Apply (`Some`) or clear (`None`) fixed-height and containment hints.
    fn set_size_hints(&mut self, node: NodeId, height: Option<f64>);

    /// Move image-like `src` references to a dormant attribute. Returns the
    /// number of references moved.
    fn defer_resources(&mut self, node: NodeId) -> usize;

    /// Inverse of [`RenderAdapter::defer_resources`].
    fn resume_resources(&mut self, node: NodeId) -> usize;

    /// Ask the runtime to reclaim memory. Advisory only.
    fn request_memory_reclaim(&mut self) -> Result<(), RenderError>;
}

/// Which visibility observer an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObserverKind {
    /// Watches live entries and reports when they leave the viewport window.
    Primary,
    /// Watches placeholders of detached entries and reports when they return.
    Placeholder,
}

/// Vertical extension of the viewport window beyond the physical viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportMargin {
    pub vertical_px: f64,
}

impl ViewportMargin {
    /// CSS `rootMargin` string for an intersection observer.
    #[must_use]
    pub fn root_margin(&self) -> String {
        format!("{}px 0px", self.vertical_px)
    }
}

/// Host-owned event sources.
///
/// Every callback the host produces is fed back through
/// [`crate::VisibilityScheduler::dispatch`]; observer callbacks carry the
/// [`Generation`] they were connected with so stale observers can be ignored.
pub trait ObserverHost {
    /// (Re)create an observer with the given margin. Callbacks from it must
    /// carry `generation`.
    fn connect(&mut self, kind: ObserverKind, generation: Generation, margin: ViewportMargin);

    /// Tear the observer down; it must not fire again.
    fn disconnect(&mut self, kind: ObserverKind);

    fn observe(&mut self, kind: ObserverKind, target: NodeId);

    fn unobserve(&mut self, kind: ObserverKind, target: NodeId);

    /// Report nodes inserted anywhere below `container`.
    fn watch_mutations(&mut self, container: NodeId);

    fn stop_watching_mutations(&mut self);

    /// Schedule one [`crate::SchedulerEvent::Idle`] at the next idle point.
    fn request_idle(&mut self, generation: Generation);

    /// Start delivering [`crate::SchedulerEvent::Tick`] every `interval`.
    fn start_maintenance(&mut self, interval: Duration);

    fn cancel_maintenance(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_margin_formats_vertical_only() {
        let margin = ViewportMargin { vertical_px: 1200.0 };
        assert_eq!(margin.root_margin(), "1200px 0px");
    }

    #[test]
    fn render_error_display() {
        assert_eq!(
            RenderError::MissingNode(NodeId(7)).to_string(),
            "node #7 does not exist"
        );
        assert_eq!(RenderError::Host("boom".into()).to_string(), "host error: boom");
    }
}
