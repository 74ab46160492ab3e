// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # obtree: An Observable State Tree with Fine-Grained Change Notification
//!
//! This crate provides a mutation-tracking engine for a tree of plain data.
//! Application state lives in a single [`Tree`]: maps and lists addressed by
//! [`NodeId`] handles, holding primitive [`Value`]s and links to child nodes.
//! Every write goes through the engine, which tracks exactly which node
//! changed and tells the interested parties, and nobody else.
//!
//! The primary goal of this library is to drive incremental consumers, such
//! as a UI that re-renders only the parts of the screen whose backing data
//! actually changed, without diffing and without manual invalidation calls.
//!
//! ## Core Concepts
//!
//! Three mechanisms cooperate:
//!
//! - **Topology.** Each node knows its parent and the key it occupies there.
//!   A node has at most one parent at a time; moving a node requires deleting
//!   it from its old location first. The engine enforces this on every write,
//!   so the "tree" is a tree by construction, never by convention.
//! - **Snapshot identity.** [`Tree::snapshot`] returns a [`Snapshot`], a
//!   cheap read view whose *equality* is the change signal: snapshots of a
//!   node taken before and after an observable change compare unequal, while
//!   untouched nodes keep their identity. Consumers that memoize on snapshot
//!   equality get precise, O(1) change detection.
//! - **Notification.** Listeners subscribe to a node for one of three event
//!   kinds: the node's own fields changed ([leaf][Tree::on_leaf_changed]),
//!   something anywhere below it changed ([subtree][Tree::on_subtree_changed]),
//!   or the node was detached ([removed][Tree::on_removed]). Subtree interest
//!   propagates rootwards from the changed node, skipping ancestors nobody
//!   listens to.
//!
//! Writes that do not change anything are free: setting a field to the value
//! it already holds emits nothing and mints no new identity.
//!
//! ## Transactions and Suppression
//!
//! [`Tree::run_transaction`] batches a closure's worth of mutations and
//! delivers the coalesced notifications once, after the closure returns: N
//! writes to one node become one event, and a delete-then-attach of the same
//! node inside one transaction is a move, not a removal.
//! [`Tree::run_silent`] goes further and suppresses notification entirely,
//! optionally also suppressing identity updates, for bulk loads where no
//! observer should fire.
//!
//! ## Derived Nodes
//!
//! [`Tree::define_derived`] registers a node whose value is computed from
//! other nodes. The dependency list is re-evaluated lazily, only while
//! someone listens to the derived node, and each dependency can carry a list
//! of comparison values so that the derived node is only re-notified when
//! the *projection* of a dependency changes, not on every write to it.
//!
//! ## Getting Started
//!
//! ```rust
//! use obtree::{Tree, Value};
//!
//! let tree = Tree::new();
//! let root = tree.new_map();
//! tree.attach_root(root)?;
//!
//! let todo = tree.new_map();
//! tree.set(root, "todo", Value::Node(todo))?;
//! tree.set(todo, "title", Value::from("write docs"))?;
//! tree.set(todo, "done", Value::from(false))?;
//!
//! // React to changes of this one node.
//! let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! tree.on_leaf_changed(todo, move |snapshot| {
//!     sink.borrow_mut().push(snapshot.get("done"));
//! })?;
//!
//! tree.set(todo, "done", Value::from(true))?;
//! tree.set(todo, "done", Value::from(true))?; // no-op, not notified
//! assert_eq!(seen.borrow().len(), 1);
//! assert_eq!(seen.borrow()[0], Some(Value::Bool(true)));
//! # Ok::<(), obtree::TreeError>(())
//! ```
//!
//! ## Scope of this Crate
//!
//! This crate is the state engine only. It does not render anything, does
//! not persist anything, and has no opinion on where mutations come from.
//! The engine is single-threaded: [`Tree`] is a cheap clonable handle meant
//! to be shared within one thread, and listeners run synchronously inside
//! the write that triggered them.
//!
//! ## License
//!
//! This project is licensed under either of
//!
//! - Apache License, Version 2.0, ([LICENSE-APACHE](LICENSE-APACHE) or http://www.apache.org/licenses/LICENSE-2.0)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or http://opensource.org/licenses/MIT)
//!
//! at your option.
//!
//! ## Features
//!
//! - `json`: Conversions between subtrees and `serde_json::Value`. Enabled
//!   by default.
//! - `serde`: Derives `serde` support for the plain data types ([`Value`],
//!   [`Key`], [`NodeId`]).
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

// Use a constant seed for hashing to make performance measurements have less variance.
pub(crate) const DETERMINISTIC_HASHER: RandomState = RandomState::with_seeds(48, 1516, 23, 42);

mod arena;
pub use arena::{ContainerKind, NodeId};
mod error;
pub use error::TreeError;
#[cfg(feature = "json")]
mod json;
/// Macros usable for tests and initialization
pub mod macros;
mod notify;
pub use notify::{EventKind, ListenerId};
mod reactive;
pub use reactive::Dependency;
mod snapshot;
pub use snapshot::Snapshot;
mod tree;
pub use tree::Tree;
mod value;
pub use value::{Key, Value};

static ENABLE_DETERMINISM: AtomicBool = AtomicBool::new(false);

/// Makes all data structures behave deterministically.
///
/// This should only be enabled for testing, as it increases the odds of DoS
/// scenarios.
#[doc(hidden)]
pub fn enable_determinism() {
    ENABLE_DETERMINISM.store(true, Ordering::Release);
}

/// Checks if determinism is enabled.
///
/// Should be used internally and for testing.
#[doc(hidden)]
pub fn determinism_enabled() -> bool {
    ENABLE_DETERMINISM.load(Ordering::Acquire)
}

/// Create a random state for a hashmap.
/// If `enable_determinism` has been used, this will return a deterministic
/// decidedly non-random RandomState, useful in tests.
#[inline]
fn make_random_state() -> RandomState {
    if determinism_enabled() {
        DETERMINISTIC_HASHER
    } else {
        // Create an instance of the standard ahash random state.
        // This will be random, and will not be the same for any two runs.
        RandomState::new()
    }
}

pub(crate) fn create_map<K, V>() -> std::collections::HashMap<K, V, TreeRandomState> {
    std::collections::HashMap::with_hasher(TreeRandomState::default())
}

/// This is a small wrapper around the standard RandomState.
/// This allows us to easily switch to a non-random RandomState for use in tests.
#[derive(Clone)]
pub struct TreeRandomState {
    inner: RandomState,
}

// Implement default, falling back on regular ahash::RandomState except
// when 'enable_determinism' has been called, in which case a static
// only-for-test RandomState is used.
impl Default for TreeRandomState {
    #[inline]
    fn default() -> Self {
        Self {
            inner: make_random_state(),
        }
    }
}

// We implement BuildHasher for TreeRandomState, but all we do is delegate to
// the wrapped 'inner' RandomState.
//
// Since TreeRandomState implements default, the user doesn't have to do anything more than
// specialize their hashmap using TreeRandomState instead of RandomState.
impl BuildHasher for TreeRandomState {
    type Hasher = <RandomState as BuildHasher>::Hasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.inner.build_hasher()
    }
}
