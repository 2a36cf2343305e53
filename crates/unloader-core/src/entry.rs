#![forbid(unsafe_code)]

//! Per-entry data model.
//!
//! An entry is one transcript turn. Its identity is the [`NodeId`] of the
//! render-tree node that holds it; the document owns the node, the registry
//! only keeps the association.

use serde::{Deserialize, Serialize};

use crate::adapter::NodeId;

/// Origin of a transcript entry, read once from the host markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[default]
    Unknown,
}

impl Role {
    /// Map the host's role attribute value to a role.
    #[must_use]
    pub fn from_attr(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("user") => Self::User,
            Some(v) if v.eq_ignore_ascii_case("assistant") => Self::Assistant,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural anchor recorded when a collapsed node is removed from the tree.
///
/// Only valid while the entry is collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detachment {
    /// Parent that owned the node at collapse time.
    pub parent: NodeId,
    /// Sibling the node preceded, `None` when it was the last child.
    pub next_sibling: Option<NodeId>,
}

/// Mutable virtualization record for one tracked entry.
///
/// Invariant: `is_collapsed` implies `stored_content` is non-empty and either
/// `placeholder` (in-place) or `detachment` (detached) is set.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryState {
    pub role: Role,
    pub is_collapsed: bool,
    /// Sanitized and possibly compressed markup. Empty when active.
    pub stored_content: String,
    pub is_compressed: bool,
    /// Rendered height captured at collapse time, in CSS pixels.
    pub original_extent: f64,
    pub detachment: Option<Detachment>,
    /// Placeholder node standing in for the content while collapsed.
    pub placeholder: Option<NodeId>,
    /// Estimate added to the saved-bytes ledger by the last collapse.
    pub saved_estimate: u64,
}

impl EntryState {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            is_collapsed: false,
            stored_content: String::new(),
            is_compressed: false,
            original_extent: 0.0,
            detachment: None,
            placeholder: None,
            saved_estimate: 0,
        }
    }

    /// Reset the collapse-scoped fields after a restore.
    pub(crate) fn clear_collapse(&mut self) {
        self.is_collapsed = false;
        self.stored_content.clear();
        self.is_compressed = false;
        self.detachment = None;
        self.placeholder = None;
        self.saved_estimate = 0;
    }
}
