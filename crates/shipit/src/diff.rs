//! Tree diff: current vs incoming.
//!
//! Siblings are matched by name. Every incoming node becomes an [`Upsert`]
//! (created, updated or unchanged), every current node without an incoming
//! namesake becomes a [`Delete`] together with each of its descendants.
//! Ids are derived from the names on the path, so a renamed node is a delete
//! of the old subtree plus a create of the new one.

use serde::Serialize;
use shipit_types::{EntityKind, ParentRef};

use crate::identity::derive_id;
use crate::schema;
use crate::tree::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

/// Write of one incoming node.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub kind: EntityKind,
    pub id: String,
    pub parent: Option<ParentRef>,
    /// Distance from the reconciled root
    pub depth: usize,
    /// Index among its incoming siblings
    pub position: usize,
    pub change: Change,
    /// Incoming node without children
    pub node: Node,
    /// Matched current node without children
    pub before: Option<Node>,
}

impl Upsert {
    /// Whether this write touches a value only authenticated readers see.
    pub fn touches_secret(&self) -> bool {
        if self.change == Change::Unchanged {
            return false;
        }
        if self.kind == EntityKind::EnvVar {
            return self.node.is_secret() || self.before.as_ref().is_some_and(Node::is_secret);
        }
        schema::fields(self.kind)
            .iter()
            .filter(|f| f.secret.is_sealed())
            .any(|f| {
                let before = self.before.as_ref().and_then(|b| b.fields.get(f.name));
                let after = self.node.fields.get(f.name);
                before != after
            })
    }
}

/// Removal of one current node.
#[derive(Debug, Clone)]
pub struct Delete {
    pub kind: EntityKind,
    pub id: String,
    pub depth: usize,
    /// Set when an ancestor is deleted too, so the store cascade also covers it
    pub cascaded: bool,
    /// Current subtree
    pub node: Node,
}

#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    /// In visiting order: parents before children, siblings in incoming order
    pub upserts: Vec<Upsert>,
    pub deletes: Vec<Delete>,
}

impl TreeDiff {
    /// Compare the root nodes of two trees.
    ///
    /// `ancestry` holds the names above the root and `parent` its owner row.
    pub fn compute(
        current: Option<&Node>,
        incoming: &Node,
        ancestry: &[String],
        parent: Option<ParentRef>,
    ) -> Self {
        let mut diff = TreeDiff::default();
        diff.visit(current.map(|c| (0, c)), incoming, 0, ancestry, parent, 0);
        diff
    }

    /// Nothing is created, updated or deleted.
    pub fn is_noop(&self) -> bool {
        self.deletes.is_empty() && self.upserts.iter().all(|u| u.change == Change::Unchanged)
    }

    pub fn touches_secret(&self) -> bool {
        self.upserts.iter().any(Upsert::touches_secret)
            || self.deletes.iter().any(|d| d.node.contains_secret())
    }

    fn visit(
        &mut self,
        current: Option<(usize, &Node)>,
        incoming: &Node,
        position: usize,
        ancestry: &[String],
        parent: Option<ParentRef>,
        depth: usize,
    ) {
        let id = derive_id(ancestry, &incoming.name);
        let change = match current {
            None => Change::Created,
            Some((was, node)) if was != position || node.fields != incoming.fields => {
                Change::Updated
            }
            Some(_) => Change::Unchanged,
        };

        let mut node = incoming.shallow();
        if let Some((_, before)) = current {
            carry_sealed(&mut node, before);
        }
        self.upserts.push(Upsert {
            kind: incoming.kind,
            id: id.clone(),
            parent,
            depth,
            position,
            change,
            node,
            before: current.map(|(_, c)| c.shallow()),
        });

        let owner = ParentRef::new(incoming.kind, id);
        let mut below = ancestry.to_vec();
        below.push(incoming.name.clone());

        for collection in incoming.kind.collections() {
            let existing = current.map(|(_, c)| c.children(collection.key)).unwrap_or_default();
            let wanted = incoming.children(collection.key);
            self.collection(existing, wanted, &below, &owner, depth + 1);
        }
    }

    fn collection(
        &mut self,
        existing: &[Node],
        wanted: &[Node],
        ancestry: &[String],
        owner: &ParentRef,
        depth: usize,
    ) {
        for gone in existing.iter().filter(|c| !wanted.iter().any(|w| w.name == c.name)) {
            self.delete(gone, ancestry, depth, false);
        }

        for (position, node) in wanted.iter().enumerate() {
            let matched = existing
                .iter()
                .enumerate()
                .find(|(_, c)| c.name == node.name);
            self.visit(matched, node, position, ancestry, Some(owner.clone()), depth);
        }
    }

    fn delete(&mut self, node: &Node, ancestry: &[String], depth: usize, cascaded: bool) {
        let id = derive_id(ancestry, &node.name);
        self.deletes.push(Delete {
            kind: node.kind,
            id,
            depth,
            cascaded,
            node: node.clone(),
        });

        let mut below = ancestry.to_vec();
        below.push(node.name.clone());
        for child in node.children.values().flatten() {
            self.delete(child, &below, depth + 1, true);
        }
    }
}

/// Keep stored ciphertext for sealed fields whose plaintext did not change.
fn carry_sealed(incoming: &mut Node, current: &Node) {
    for (key, sealed) in &current.sealed {
        if incoming.fields.get(key) == current.fields.get(key) {
            incoming.sealed.insert(key.clone(), sealed.clone());
        }
    }
}
