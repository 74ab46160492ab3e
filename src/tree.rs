// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # The Tree Engine
//!
//! [`Tree`] is the engine object that owns everything the original design
//! kept in module-global state: the node arena, the listener registry, the
//! pending-transaction log, the suppression flags, and the dependency graph.
//! It is a cheap-to-clone handle (an `Rc` internally), so listener callbacks
//! can capture their own copy and mutate the tree re-entrantly; the model is
//! strictly single-threaded and cooperative, and every borrow of internal
//! state is released before user code runs.
//!
//! This module implements the wrapper layer and the topology registry:
//! explicit `get`/`set`/`delete` in place of transparent property
//! interception, recursive attachment of structured values, the
//! single-parent invariant, and list compaction with parent-link
//! re-indexing. Change propagation lives in [`notify`](crate::notify), the
//! dependency graph in [`reactive`](crate::reactive).

use crate::{
    arena::{Arena, Container, ContainerKind, NodeId, ParentLink},
    error::TreeError,
    notify::ListenerRegistry,
    reactive::DepGraph,
    value::{Key, Value},
};
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// An observable state tree.
///
/// Cloning a `Tree` clones the handle, not the state: all clones observe and
/// mutate the same tree.
///
/// # Example
///
/// ```rust
/// use obtree::{Tree, Value};
///
/// let tree = Tree::new();
/// let root = tree.new_map();
/// tree.attach_root(root).unwrap();
/// tree.set(root, "count", Value::from(0)).unwrap();
///
/// let seen = std::rc::Rc::new(std::cell::Cell::new(0));
/// let observed = seen.clone();
/// tree.on_leaf_changed(root, move |snapshot| {
///     observed.set(snapshot.get("count").unwrap().as_i64().unwrap());
/// })
/// .unwrap();
///
/// tree.set(root, "count", Value::from(1)).unwrap();
/// assert_eq!(seen.get(), 1);
/// ```
#[derive(Clone)]
pub struct Tree {
    pub(crate) inner: Rc<TreeInner>,
}

pub(crate) struct TreeInner {
    pub(crate) arena: RefCell<Arena>,
    pub(crate) listeners: RefCell<ListenerRegistry>,
    pub(crate) tx: RefCell<Option<crate::notify::TxLog>>,
    pub(crate) skip_emission: Cell<bool>,
    pub(crate) skip_reproxy: Cell<bool>,
    pub(crate) deps: RefCell<DepGraph>,
    pub(crate) root: Cell<Option<NodeId>>,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.inner.root.get())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// Creates an empty engine with no root.
    pub fn new() -> Self {
        Tree {
            inner: Rc::new(TreeInner {
                arena: RefCell::new(Arena::default()),
                listeners: RefCell::new(ListenerRegistry::default()),
                tx: RefCell::new(None),
                skip_emission: Cell::new(false),
                skip_reproxy: Cell::new(false),
                deps: RefCell::new(DepGraph::default()),
                root: Cell::new(None),
            }),
        }
    }

    /// True if the two handles refer to the same engine.
    #[inline]
    pub fn ptr_eq(&self, other: &Tree) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a detached map node. Attach it by assigning it into an
    /// already-attached parent, or via [`attach_root`](Tree::attach_root).
    pub fn new_map(&self) -> NodeId {
        self.inner.arena.borrow_mut().insert(Container::new_map())
    }

    /// Creates a detached list node.
    pub fn new_list(&self) -> NodeId {
        self.inner.arena.borrow_mut().insert(Container::new_list())
    }

    /// Declares `node` as the root of this tree.
    ///
    /// One-time entry point: attaching a second root, or a node that already
    /// has a parent, is an [`TreeError::InvalidMove`].
    pub fn attach_root(&self, node: NodeId) -> Result<NodeId, TreeError> {
        {
            let arena = self.inner.arena.borrow();
            let data = arena.get(node)?;
            if data.parent.is_some() || self.inner.root.get().is_some() {
                return Err(TreeError::InvalidMove { node });
            }
        }
        self.inner.root.set(Some(node));
        self.cancel_pending_removed(node);
        Ok(node)
    }

    /// The root node, if one has been attached.
    pub fn root(&self) -> Option<NodeId> {
        self.inner.root.get()
    }

    /// True if `id` names a live node of this tree.
    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.arena.borrow().contains(id)
    }

    /// The container shape of `node`.
    pub fn kind(&self, node: NodeId) -> Result<ContainerKind, TreeError> {
        Ok(self.inner.arena.borrow().get(node)?.container.kind())
    }

    /// Number of fields (map) or elements (list) currently held by `node`.
    pub fn len(&self, node: NodeId) -> Result<usize, TreeError> {
        Ok(self.inner.arena.borrow().get(node)?.container.len())
    }

    pub fn is_empty(&self, node: NodeId) -> Result<bool, TreeError> {
        Ok(self.len(node)? == 0)
    }

    /// The field names of a map node.
    pub fn keys(&self, node: NodeId) -> Result<Vec<String>, TreeError> {
        let arena = self.inner.arena.borrow();
        match &arena.get(node)?.container {
            Container::Map(m) => {
                let mut keys: Vec<String> = m.keys().cloned().collect();
                keys.sort_unstable();
                Ok(keys)
            }
            Container::List(_) => Err(TreeError::KindMismatch {
                expected: ContainerKind::Map,
                found: ContainerKind::List,
            }),
        }
    }

    /// Reads one field. Absent map fields and out-of-range list indices read
    /// as `None`; a key of the wrong kind for the container is an error.
    pub fn get(&self, node: NodeId, key: impl Into<Key>) -> Result<Option<Value>, TreeError> {
        let key = key.into();
        let arena = self.inner.arena.borrow();
        let data = arena.get(node)?;
        read_field(&data.container, &key).map(|v| v.cloned())
    }

    /// The parent of `node`, or `None` for the root and for detached nodes.
    pub fn parent_of(&self, node: NodeId) -> Result<Option<NodeId>, TreeError> {
        let arena = self.inner.arena.borrow();
        Ok(arena.get(node)?.parent.as_ref().map(|link| link.parent))
    }

    /// The key under which `node` is held by its parent.
    pub fn key_in_parent(&self, node: NodeId) -> Result<Option<Key>, TreeError> {
        let arena = self.inner.arena.borrow();
        Ok(arena.get(node)?.parent.as_ref().map(|link| link.key.clone()))
    }

    /// Writes one field of `node`.
    ///
    /// Writing a value equal to what the field already holds is a no-op: no
    /// notification fires and no new snapshot is minted. A structured old
    /// value is detached and reported as removed; a structured new value is
    /// attached, which fails with [`TreeError::InvalidMove`] if it already
    /// has a different parent. List writes require `index < len`; use
    /// [`push`](Tree::push) or [`insert`](Tree::insert) to grow a list.
    pub fn set(&self, node: NodeId, key: impl Into<Key>, value: Value) -> Result<(), TreeError> {
        let key = key.into();
        let incoming = value.as_node();
        let mut detached: Option<NodeId> = None;
        {
            let mut arena = self.inner.arena.borrow_mut();
            let data = arena.get(node)?;
            let old = match (&data.container, &key) {
                (Container::Map(m), Key::Field(name)) => m.get(name).cloned(),
                (Container::List(l), Key::Index(i)) => {
                    if *i >= l.len() {
                        return Err(TreeError::OutOfBounds {
                            node,
                            index: *i,
                            len: l.len(),
                        });
                    }
                    Some(l[*i].clone())
                }
                (c, k) => return Err(kind_mismatch(c, k)),
            };
            // Idempotent write: also what makes re-assignment of a child to
            // its current slot legal.
            if old.as_ref() == Some(&value) {
                return Ok(());
            }
            if let Some(child) = incoming {
                check_attachable(&arena, child, node, &key)?;
            }
            if let Some(old_child) = old.as_ref().and_then(Value::as_node) {
                detached = detach_if_held(&mut arena, old_child, node, &key)?;
            }
            let data = arena.get_mut(node)?;
            match (&mut data.container, &key) {
                (Container::Map(m), Key::Field(name)) => {
                    m.insert(name.clone(), value);
                }
                (Container::List(l), Key::Index(i)) => l[*i] = value,
                _ => unreachable!("container kind checked above"),
            }
            if let Some(child) = incoming {
                arena.get_mut(child)?.parent = Some(ParentLink {
                    parent: node,
                    key: key.clone(),
                });
            }
        }
        if let Some(child) = incoming {
            self.cancel_pending_removed(child);
        }
        self.touch(node)?;
        self.propagate_change(node)?;
        if let Some(old_child) = detached {
            self.emit_removed(old_child);
        }
        Ok(())
    }

    /// Deletes one field of `node`, returning the previous value.
    ///
    /// Deleting an absent map field is a no-op. List deletes compact the
    /// list and re-index the parent links of the elements that shift down.
    pub fn delete(&self, node: NodeId, key: impl Into<Key>) -> Result<Option<Value>, TreeError> {
        let key = key.into();
        let old;
        let mut detached: Option<NodeId> = None;
        {
            let mut arena = self.inner.arena.borrow_mut();
            let data = arena.get_mut(node)?;
            old = match (&mut data.container, &key) {
                (Container::Map(m), Key::Field(name)) => match m.remove(name) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                (Container::List(l), Key::Index(i)) => {
                    if *i >= l.len() {
                        return Err(TreeError::OutOfBounds {
                            node,
                            index: *i,
                            len: l.len(),
                        });
                    }
                    l.remove(*i)
                }
                (c, k) => return Err(kind_mismatch(c, k)),
            };
            if let Key::Index(i) = &key {
                reindex_list_links(&mut arena, node, *i)?;
            }
            if let Some(old_child) = old.as_node() {
                detached = detach_if_held(&mut arena, old_child, node, &key)?;
            }
        }
        self.touch(node)?;
        self.propagate_change(node)?;
        if let Some(old_child) = detached {
            self.emit_removed(old_child);
        }
        Ok(Some(old))
    }

    /// Appends `value` to a list node.
    pub fn push(&self, node: NodeId, value: Value) -> Result<usize, TreeError> {
        let len = self.len(node)?;
        self.insert(node, len, value)?;
        Ok(len)
    }

    /// Inserts `value` at `index` of a list node, shifting later elements up
    /// (their parent links are re-indexed). `index == len` appends.
    pub fn insert(&self, node: NodeId, index: usize, value: Value) -> Result<(), TreeError> {
        let incoming = value.as_node();
        {
            let mut arena = self.inner.arena.borrow_mut();
            let data = arena.get(node)?;
            let len = match &data.container {
                Container::List(l) => l.len(),
                Container::Map(_) => {
                    return Err(TreeError::KindMismatch {
                        expected: ContainerKind::List,
                        found: ContainerKind::Map,
                    });
                }
            };
            if index > len {
                return Err(TreeError::OutOfBounds { node, index, len });
            }
            if let Some(child) = incoming {
                check_attachable(&arena, child, node, &Key::Index(index))?;
            }
            let data = arena.get_mut(node)?;
            match &mut data.container {
                Container::List(l) => l.insert(index, value),
                Container::Map(_) => unreachable!("container kind checked above"),
            }
            reindex_list_links(&mut arena, node, index)?;
            if let Some(child) = incoming {
                arena.get_mut(child)?.parent = Some(ParentLink {
                    parent: node,
                    key: Key::Index(index),
                });
            }
        }
        if let Some(child) = incoming {
            self.cancel_pending_removed(child);
        }
        self.touch(node)?;
        self.propagate_change(node)
    }

    /// Frees a detached subtree: arena slots, listeners, pending emissions,
    /// and dependency links of every node in it.
    ///
    /// The node must currently be detached (no parent, not the root);
    /// releasing an attached node is an [`TreeError::InvalidMove`]. All
    /// outstanding ids into the subtree become stale and subsequently report
    /// [`TreeError::NotAttached`].
    pub fn release(&self, node: NodeId) -> Result<(), TreeError> {
        {
            let arena = self.inner.arena.borrow();
            let data = arena.get(node)?;
            if data.parent.is_some() || self.inner.root.get() == Some(node) {
                return Err(TreeError::InvalidMove { node });
            }
        }
        let mut stack: SmallVec<[NodeId; 8]> = SmallVec::new();
        stack.push(node);
        while let Some(id) = stack.pop() {
            let data = self.inner.arena.borrow_mut().remove(id)?;
            for (_, child) in data.container.children() {
                stack.push(child);
            }
            self.inner.listeners.borrow_mut().remove_all_for(id);
            self.inner.deps.borrow_mut().prune(id);
            if let Some(tx) = self.inner.tx.borrow_mut().as_mut() {
                tx.cancel_all(id);
            }
        }
        Ok(())
    }

    /// Mints a new snapshot identity for `node`, unless reproxying is
    /// currently suppressed.
    pub(crate) fn touch(&self, node: NodeId) -> Result<(), TreeError> {
        if self.inner.skip_reproxy.get() {
            return Ok(());
        }
        let mut arena = self.inner.arena.borrow_mut();
        let data = arena.get_mut(node)?;
        data.epoch += 1;
        Ok(())
    }
}

fn kind_mismatch(container: &Container, key: &Key) -> TreeError {
    let expected = match key {
        Key::Field(_) => ContainerKind::Map,
        Key::Index(_) => ContainerKind::List,
    };
    TreeError::KindMismatch {
        expected,
        found: container.kind(),
    }
}

pub(crate) fn read_field<'c>(
    container: &'c Container,
    key: &Key,
) -> Result<Option<&'c Value>, TreeError> {
    match (container, key) {
        (Container::Map(m), Key::Field(name)) => Ok(m.get(name)),
        (Container::List(l), Key::Index(i)) => Ok(l.get(*i)),
        (c, k) => Err(kind_mismatch(c, k)),
    }
}

/// Validates the single-parent invariant for attaching `child` at
/// `(parent, key)`: the child must have no current parent (an equal
/// re-assignment never reaches here, it is a no-op write), and it must not
/// be an ancestor of the destination.
fn check_attachable(
    arena: &Arena,
    child: NodeId,
    parent: NodeId,
    _key: &Key,
) -> Result<(), TreeError> {
    if arena.get(child)?.parent.is_some() {
        return Err(TreeError::InvalidMove { node: child });
    }
    let mut cursor = Some(parent);
    while let Some(id) = cursor {
        if id == child {
            return Err(TreeError::InvalidMove { node: child });
        }
        cursor = arena.get(id)?.parent.as_ref().map(|link| link.parent);
    }
    Ok(())
}

/// Clears `child`'s parent link if it still points at `(parent, key)`.
///
/// If an earlier write in the same micro-step already repointed the link,
/// the child was re-attached rather than removed, and no removal may be
/// reported for it.
fn detach_if_held(
    arena: &mut Arena,
    child: NodeId,
    parent: NodeId,
    key: &Key,
) -> Result<Option<NodeId>, TreeError> {
    let data = arena.get_mut(child)?;
    match &data.parent {
        Some(link) if link.parent == parent && link.key == *key => {
            data.parent = None;
            Ok(Some(child))
        }
        _ => Ok(None),
    }
}

/// Rewrites the parent links of structured list elements at `from..` to
/// their current position. Needed after compaction and insertion shifts.
fn reindex_list_links(arena: &mut Arena, list: NodeId, from: usize) -> Result<(), TreeError> {
    let moved: SmallVec<[(NodeId, usize); 8]> = match &arena.get(list)?.container {
        Container::List(l) => l
            .iter()
            .enumerate()
            .skip(from)
            .filter_map(|(i, v)| v.as_node().map(|id| (id, i)))
            .collect(),
        Container::Map(_) => return Ok(()),
    };
    for (child, index) in moved {
        let data = arena.get_mut(child)?;
        if let Some(link) = &mut data.parent {
            if link.parent == list {
                link.key = Key::Index(index);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    fn rooted() -> (Tree, NodeId) {
        let tree = Tree::new();
        let root = tree.new_map();
        tree.attach_root(root).unwrap();
        (tree, root)
    }

    #[test]
    fn set_and_get_primitives() {
        let (tree, root) = rooted();
        tree.set(root, "name", Value::from("alice")).unwrap();
        tree.set(root, "age", Value::from(30)).unwrap();
        assert_eq!(tree.get(root, "name").unwrap(), Some(Value::from("alice")));
        assert_eq!(tree.get(root, "age").unwrap(), Some(Value::I64(30)));
        assert_eq!(tree.get(root, "missing").unwrap(), None);
        assert_eq!(tree.len(root).unwrap(), 2);
    }

    #[test]
    fn attaching_a_child_sets_its_parent_link() {
        let (tree, root) = rooted();
        let child = tree.new_map();
        assert_eq!(tree.parent_of(child).unwrap(), None);
        tree.set(root, "child", Value::Node(child)).unwrap();
        assert_eq!(tree.parent_of(child).unwrap(), Some(root));
        assert_eq!(tree.key_in_parent(child).unwrap(), Some(Key::from("child")));
    }

    #[test]
    fn second_parent_is_rejected() {
        let (tree, root) = rooted();
        let a = tree.new_map();
        let b = tree.new_map();
        let c = tree.new_map();
        tree.set(root, "a", Value::Node(a)).unwrap();
        tree.set(root, "b", Value::Node(b)).unwrap();
        tree.set(a, "child", Value::Node(c)).unwrap();
        assert_eq!(
            tree.set(b, "child", Value::Node(c)),
            Err(TreeError::InvalidMove { node: c })
        );
        // still attached where it was
        assert_eq!(tree.parent_of(c).unwrap(), Some(a));
    }

    #[test]
    fn delete_then_reattach_is_a_legal_move() {
        let (tree, root) = rooted();
        let a = tree.new_map();
        let b = tree.new_map();
        let c = tree.new_map();
        tree.set(root, "a", Value::Node(a)).unwrap();
        tree.set(root, "b", Value::Node(b)).unwrap();
        tree.set(a, "child", Value::Node(c)).unwrap();
        tree.delete(a, "child").unwrap();
        tree.set(b, "child", Value::Node(c)).unwrap();
        assert_eq!(tree.parent_of(c).unwrap(), Some(b));
    }

    #[test]
    fn cycle_is_rejected() {
        let (tree, root) = rooted();
        let a = tree.new_map();
        tree.set(root, "a", Value::Node(a)).unwrap();
        assert_eq!(
            tree.set(a, "loop", Value::Node(root)),
            Err(TreeError::InvalidMove { node: root })
        );
        assert_eq!(
            tree.set(a, "self", Value::Node(a)),
            Err(TreeError::InvalidMove { node: a })
        );
    }

    #[test]
    fn overwriting_a_child_detaches_it() {
        let (tree, root) = rooted();
        let child = tree.new_map();
        tree.set(root, "slot", Value::Node(child)).unwrap();
        tree.set(root, "slot", Value::from(1)).unwrap();
        assert_eq!(tree.parent_of(child).unwrap(), None);
        assert_eq!(tree.get(root, "slot").unwrap(), Some(Value::I64(1)));
    }

    #[test]
    fn list_compaction_reindexes_parent_links() {
        let (tree, root) = rooted();
        let list = tree.new_list();
        tree.set(root, "list", Value::Node(list)).unwrap();
        let a = tree.new_map();
        let b = tree.new_map();
        tree.push(list, Value::Node(a)).unwrap();
        tree.push(list, Value::from("filler")).unwrap();
        tree.push(list, Value::Node(b)).unwrap();
        assert_eq!(tree.key_in_parent(b).unwrap(), Some(Key::Index(2)));

        tree.delete(list, 1).unwrap();
        assert_eq!(tree.len(list).unwrap(), 2);
        assert_eq!(tree.key_in_parent(b).unwrap(), Some(Key::Index(1)));
        assert_eq!(tree.key_in_parent(a).unwrap(), Some(Key::Index(0)));
    }

    #[test]
    fn list_insert_shifts_links_up() {
        let (tree, root) = rooted();
        let list = tree.new_list();
        tree.set(root, "list", Value::Node(list)).unwrap();
        let a = tree.new_map();
        tree.push(list, Value::Node(a)).unwrap();
        tree.insert(list, 0, Value::from(0)).unwrap();
        assert_eq!(tree.key_in_parent(a).unwrap(), Some(Key::Index(1)));
    }

    #[test]
    fn out_of_bounds_writes_are_rejected() {
        let (tree, root) = rooted();
        let list = tree.new_list();
        tree.set(root, "list", Value::Node(list)).unwrap();
        assert!(matches!(
            tree.set(list, 0, Value::from(1)),
            Err(TreeError::OutOfBounds { index: 0, len: 0, .. })
        ));
        assert!(matches!(
            tree.insert(list, 2, Value::from(1)),
            Err(TreeError::OutOfBounds { index: 2, len: 0, .. })
        ));
    }

    #[test]
    fn key_kind_must_match_container() {
        let (tree, root) = rooted();
        assert_eq!(
            tree.get(root, 0),
            Err(TreeError::KindMismatch {
                expected: ContainerKind::List,
                found: ContainerKind::Map,
            })
        );
    }

    #[test]
    fn release_frees_the_whole_subtree() {
        let (tree, root) = rooted();
        let a = tree.new_map();
        let b = tree.new_map();
        tree.set(root, "a", Value::Node(a)).unwrap();
        tree.set(a, "b", Value::Node(b)).unwrap();
        assert_eq!(tree.release(a), Err(TreeError::InvalidMove { node: a }));

        tree.delete(root, "a").unwrap();
        tree.release(a).unwrap();
        assert!(!tree.contains(a));
        assert!(!tree.contains(b));
        assert_eq!(tree.parent_of(b), Err(TreeError::NotAttached { node: b }));
    }

    #[test]
    fn second_root_is_rejected() {
        let (tree, _root) = rooted();
        let other = tree.new_map();
        assert_eq!(
            tree.attach_root(other),
            Err(TreeError::InvalidMove { node: other })
        );
    }

    // A small mutation script driven by quickcheck. Indices address the pool
    // of nodes created so far; invalid combinations are expected to error
    // and are ignored, the property only cares that topology stays
    // consistent afterwards.
    #[derive(Clone, Debug)]
    enum Op {
        SetPrim { node: u8, key: u8, val: i64 },
        AttachNew { node: u8, key: u8 },
        Move { from: u8, key: u8, to: u8, to_key: u8 },
        Delete { node: u8, key: u8 },
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 4 {
                0 => Op::SetPrim {
                    node: u8::arbitrary(g),
                    key: u8::arbitrary(g),
                    val: i64::arbitrary(g),
                },
                1 => Op::AttachNew {
                    node: u8::arbitrary(g),
                    key: u8::arbitrary(g),
                },
                2 => Op::Move {
                    from: u8::arbitrary(g),
                    key: u8::arbitrary(g),
                    to: u8::arbitrary(g),
                    to_key: u8::arbitrary(g),
                },
                _ => Op::Delete {
                    node: u8::arbitrary(g),
                    key: u8::arbitrary(g),
                },
            }
        }
    }

    const FIELDS: [&str; 4] = ["a", "b", "c", "d"];

    fn pick(pool: &[NodeId], raw: u8) -> NodeId {
        pool[raw as usize % pool.len()]
    }

    #[quickcheck]
    fn topology_stays_consistent(ops: Vec<Op>) -> bool {
        let (tree, root) = rooted();
        let mut pool = vec![root];
        for op in ops {
            match op {
                Op::SetPrim { node, key, val } => {
                    let n = pick(&pool, node);
                    let _ = tree.set(n, FIELDS[key as usize % 4], Value::from(val));
                }
                Op::AttachNew { node, key } => {
                    let n = pick(&pool, node);
                    let fresh = tree.new_map();
                    if tree.set(n, FIELDS[key as usize % 4], Value::Node(fresh)).is_ok() {
                        pool.push(fresh);
                    }
                }
                Op::Move { from, key, to, to_key } => {
                    let from = pick(&pool, from);
                    let to = pick(&pool, to);
                    let key = FIELDS[key as usize % 4];
                    if let Ok(Some(Value::Node(child))) = tree.get(from, key) {
                        let _ = tree.run_transaction(|| {
                            tree.delete(from, key)?;
                            tree.set(to, FIELDS[to_key as usize % 4], Value::Node(child))
                        });
                    }
                }
                Op::Delete { node, key } => {
                    let n = pick(&pool, node);
                    let _ = tree.delete(n, FIELDS[key as usize % 4]);
                }
            }
        }
        // Every structured field value points back at its holder, and every
        // parent link is matched by a field that holds the child.
        pool.iter().all(|&node| {
            if !tree.contains(node) {
                return true;
            }
            let held_children: Vec<(String, NodeId)> = FIELDS
                .iter()
                .filter_map(|f| match tree.get(node, *f) {
                    Ok(Some(Value::Node(c))) => Some((f.to_string(), c)),
                    _ => None,
                })
                .collect();
            held_children.iter().all(|(f, c)| {
                tree.parent_of(*c).unwrap() == Some(node)
                    && tree.key_in_parent(*c).unwrap() == Some(Key::from(f.as_str()))
            })
        })
    }
}
