// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Snapshot Identity
//!
//! A [`Snapshot`] is a disposable read view of a node whose *identity* is
//! the change signal: after any observable change to a node, its current
//! snapshot compares unequal to every snapshot taken before, while the
//! snapshots of untouched nodes keep comparing equal. Consumers that
//! memoize on equality re-render exactly the subtrees whose data changed.
//!
//! Identity is an epoch counter on the node's arena slot, so producing a
//! new snapshot is O(1): no cloning of the underlying data ever happens.
//! Reads are read-through — asking a stale snapshot for a child yields the
//! child's *current* snapshot, so even a snapshot held across many changes
//! always exposes the latest tree state. Writes through a snapshot are
//! forwarded unchanged to the canonical write path of the engine.

use crate::{
    arena::{ContainerKind, NodeId},
    error::TreeError,
    tree::{Tree, read_field},
    value::{Key, Value},
};
use std::fmt;

/// An identity-stamped read view of one node.
///
/// Equality compares engine, node, and snapshot epoch: two snapshots are
/// equal exactly when they were taken from the same node with no observable
/// change in between.
#[derive(Clone)]
pub struct Snapshot {
    tree: Tree,
    node: NodeId,
    epoch: u64,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.tree.ptr_eq(&other.tree) && self.node == other.node && self.epoch == other.epoch
    }
}

impl Eq for Snapshot {}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot({}@{})", self.node, self.epoch)
    }
}

impl Snapshot {
    /// The node this snapshot was taken from.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// True if the node has changed since this snapshot was taken.
    pub fn is_stale(&self) -> bool {
        self.tree
            .snapshot(self.node)
            .map_or(true, |current| current.epoch != self.epoch)
    }

    /// Reads one field of the live node. Structured children come back as
    /// [`Value::Node`]; use [`child`](Snapshot::child) to view them.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        let arena = self.tree.inner.arena.borrow();
        let data = arena.get(self.node).ok()?;
        read_field(&data.container, &key.into()).ok().flatten().cloned()
    }

    /// The *current* snapshot of a structured child (read-through: a stale
    /// parent snapshot still yields fresh child views).
    pub fn child(&self, key: impl Into<Key>) -> Option<Snapshot> {
        let child = self.get(key)?.as_node()?;
        self.tree.snapshot(child).ok()
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        self.tree.kind(self.node).ok()
    }

    pub fn len(&self) -> usize {
        self.tree.len(self.node).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes through to the canonical node; mutation is always performed
    /// against the live tree, never against the view.
    pub fn set(&self, key: impl Into<Key>, value: Value) -> Result<(), TreeError> {
        self.tree.set(self.node, key, value)
    }

    /// Deletes through to the canonical node.
    pub fn delete(&self, key: impl Into<Key>) -> Result<Option<Value>, TreeError> {
        self.tree.delete(self.node, key)
    }
}

impl Tree {
    /// The current snapshot of `node`.
    ///
    /// For a newly attached node that has never been through a notified
    /// change, this is the node's original identity (epoch 0).
    pub fn snapshot(&self, node: NodeId) -> Result<Snapshot, TreeError> {
        let epoch = self.inner.arena.borrow().get(node)?.epoch;
        Ok(Snapshot {
            tree: self.clone(),
            node,
            epoch,
        })
    }
}
