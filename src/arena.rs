// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Node Arena
//!
//! Storage for every structured node of an observed tree. Nodes are addressed
//! by a generational [`NodeId`]: the index part names a slot, the generation
//! part detects stale handles to slots that have since been released and
//! reused. Identity of a node *is* its id, and every side table in the engine
//! (listeners, pending emissions, dependency links) is keyed by it and pruned
//! explicitly when the node is released.
//!
//! The arena also owns the topology: each slot carries the node's single
//! [`ParentLink`], which is rewritten in place when the node moves. Walking
//! one link answers `parent_of`; the engine walks the chain to attribute a
//! change to every ancestor.

use crate::{
    TreeRandomState, create_map,
    error::TreeError,
    value::{Key, Value},
};
use std::{collections::HashMap, fmt};

/// A stable handle to one structured node of a [`Tree`](crate::Tree).
///
/// Ids are never reused: releasing a node bumps its slot's generation, so a
/// handle kept across the release fails with
/// [`TreeError::NotAttached`](crate::TreeError) instead of silently reading
/// whatever node landed in the slot next.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// The container shape of a structured node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum ContainerKind {
    /// Named fields, like a JSON object.
    Map,
    /// Integer-indexed elements, like a JSON array.
    List,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Map => write!(f, "map"),
            ContainerKind::List => write!(f, "list"),
        }
    }
}

/// The raw field storage of a node.
#[derive(Debug, Clone)]
pub(crate) enum Container {
    Map(HashMap<String, Value, TreeRandomState>),
    List(Vec<Value>),
}

impl Container {
    pub(crate) fn new_map() -> Self {
        Container::Map(create_map())
    }

    pub(crate) fn new_list() -> Self {
        Container::List(Vec::new())
    }

    pub(crate) fn kind(&self) -> ContainerKind {
        match self {
            Container::Map(_) => ContainerKind::Map,
            Container::List(_) => ContainerKind::List,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Container::Map(m) => m.len(),
            Container::List(l) => l.len(),
        }
    }

    /// Iterates over the structured children currently stored in this
    /// container, with the key under which each one is held.
    pub(crate) fn children(&self) -> impl Iterator<Item = (Key, NodeId)> + '_ {
        let (map, list) = match self {
            Container::Map(m) => (Some(m), None),
            Container::List(l) => (None, Some(l)),
        };
        let from_map = map.into_iter().flatten().filter_map(|(k, v)| match v {
            Value::Node(id) => Some((Key::Field(k.clone()), *id)),
            _ => None,
        });
        let from_list = list
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(|(i, v)| match v {
                Value::Node(id) => Some((Key::Index(i), *id)),
                _ => None,
            });
        from_map.chain(from_list)
    }
}

/// The back-reference from a node to the slot that holds it.
///
/// Shared state, not a cache: the link is rewritten in place on every move,
/// and there is at most one of these per node (the single-parent invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub(crate) parent: NodeId,
    pub(crate) key: Key,
}

/// One node's payload: raw fields, parent link, and the snapshot epoch used
/// for identity-based change detection.
#[derive(Debug)]
pub(crate) struct NodeData {
    pub(crate) container: Container,
    pub(crate) parent: Option<ParentLink>,
    /// Bumped on every observable change to this node. Epoch 0 means the node
    /// has never been reproxied, so the canonical wrapper still doubles as
    /// its own current snapshot.
    pub(crate) epoch: u64,
}

impl NodeData {
    fn new(container: Container) -> Self {
        NodeData {
            container,
            parent: None,
            epoch: 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    data: Option<NodeData>,
}

/// Generational slot arena holding every node of one tree.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn insert(&mut self, container: Container) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.data.is_none());
                slot.data = Some(NodeData::new(container));
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("arena exceeds u32 slots");
                self.slots.push(Slot {
                    generation: 1,
                    data: Some(NodeData::new(container)),
                });
                NodeId {
                    index,
                    generation: 1,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<&NodeData, TreeError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_ref())
            .ok_or(TreeError::NotAttached { node: id })
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData, TreeError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_mut())
            .ok_or(TreeError::NotAttached { node: id })
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_ok()
    }

    /// Frees a slot. The generation bump invalidates every outstanding handle
    /// to the node.
    pub(crate) fn remove(&mut self, id: NodeId) -> Result<NodeData, TreeError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.data.is_some())
            .ok_or(TreeError::NotAttached { node: id })?;
        let data = slot.data.take().expect("checked above");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(data)
    }
}
