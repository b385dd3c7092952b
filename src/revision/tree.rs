//! Per-document revision tree
//!
//! Stores every known revision of one document, tracks which revisions are
//! leaves, and picks the winning leaf. Interior revisions drop their body once
//! a child supersedes them; only leaves need content.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::{next_revision, Revision, RevisionRef};

/// A revision together with its content.
#[derive(Clone, Debug, PartialEq)]
pub struct RevisionNode {
    pub revision: Revision,
    pub deleted: bool,
    /// `None` for interior revisions and for ancestry stubs
    pub body: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Clone, Debug, Default)]
pub struct RevisionTree {
    nodes: BTreeMap<RevisionRef, RevisionNode>,
    leaves: BTreeSet<RevisionRef>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, rev: &RevisionRef) -> Option<&RevisionNode> {
        self.nodes.get(rev)
    }

    pub fn contains(&self, rev: &RevisionRef) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn is_leaf(&self, rev: &RevisionRef) -> bool {
        self.leaves.contains(rev)
    }

    /// Leaves in ascending winner order (the last one wins)
    pub fn leaves(&self) -> impl Iterator<Item = &RevisionNode> + '_ {
        self.leaves.iter().filter_map(|r| self.nodes.get(r))
    }

    /// The winning leaf: highest generation, ties broken by greatest hash.
    pub fn winner(&self) -> Option<&RevisionNode> {
        self.leaves.iter().next_back().and_then(|r| self.nodes.get(r))
    }

    /// Every leaf except the winner
    pub fn conflicts(&self) -> Vec<&RevisionNode> {
        let mut leaves: Vec<&RevisionNode> = self.leaves().collect();
        leaves.pop();
        leaves
    }

    /// Known ancestors of `rev`, nearest first.
    pub fn ancestry(&self, rev: &RevisionRef) -> Vec<RevisionRef> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(rev).and_then(|n| n.revision.parent);
        while let Some(parent) = cursor {
            out.push(parent);
            cursor = self.nodes.get(&parent).and_then(|n| n.revision.parent);
        }
        out
    }

    /// Whether `ancestor` lies on the parent chain of `descendant`.
    ///
    /// A revision is not its own ancestor. A write whose parent is an ancestor
    /// of (or equal to) the winner is a linear update; anything else diverges.
    pub fn is_ancestor(&self, ancestor: &RevisionRef, descendant: &RevisionRef) -> bool {
        if ancestor.generation >= descendant.generation {
            return false;
        }
        let mut cursor = self.nodes.get(descendant).and_then(|n| n.revision.parent);
        while let Some(parent) = cursor {
            if parent == *ancestor {
                return true;
            }
            if parent.generation <= ancestor.generation {
                return false;
            }
            cursor = self.nodes.get(&parent).and_then(|n| n.revision.parent);
        }
        false
    }

    /// Append a child of `parent` (or a new root) and return the new revision.
    pub fn extend(&mut self, parent: Option<&Revision>, body: Value, deleted: bool) -> (Revision, InsertOutcome) {
        let revision = next_revision(parent, &body, deleted);
        let outcome = self.insert(RevisionNode {
            revision: revision.clone(),
            deleted,
            body: Some(body),
        });
        (revision, outcome)
    }

    /// Insert a node. Existing revisions are left untouched.
    pub fn insert(&mut self, node: RevisionNode) -> InsertOutcome {
        let id = node.revision.id();
        if let Some(existing) = self.nodes.get_mut(&id) {
            // A stub learns its content if the full revision arrives later
            if existing.body.is_none() && node.body.is_some() && self.leaves.contains(&id) {
                existing.body = node.body;
                existing.deleted = node.deleted;
            }
            return InsertOutcome::AlreadyPresent;
        }

        if let Some(parent) = node.revision.parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.body = None;
            }
            self.leaves.remove(&parent);
        }

        let has_child = self
            .nodes
            .values()
            .any(|n| n.revision.parent == Some(id));
        if !has_child {
            self.leaves.insert(id);
        }
        self.nodes.insert(id, node);
        InsertOutcome::Inserted
    }

    /// Insert a revision received from elsewhere along with its ancestry
    /// (nearest first), creating body-less stubs for unknown ancestors.
    pub fn graft(
        &mut self,
        revision: Revision,
        deleted: bool,
        body: Value,
        ancestry: &[RevisionRef],
    ) -> InsertOutcome {
        if self.contains(&revision.id()) {
            return InsertOutcome::AlreadyPresent;
        }

        for (i, ancestor) in ancestry.iter().enumerate().rev() {
            if self.contains(ancestor) {
                continue;
            }
            let parent = ancestry.get(i + 1).copied();
            self.insert(RevisionNode {
                revision: Revision {
                    generation: ancestor.generation,
                    hash: ancestor.hash,
                    parent,
                },
                deleted: false,
                body: None,
            });
        }

        self.insert(RevisionNode {
            revision,
            deleted,
            body: Some(body),
        })
    }
}
