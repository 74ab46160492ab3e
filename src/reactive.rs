// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Derived Nodes
//!
//! A derived node ("dependency host") is a node whose "changed" status is
//! computed from other nodes' changes rather than only from its own direct
//! mutation. It declares an ordered list of [`Dependency`] entries via a
//! pure evaluation function; the engine maintains back-links from each
//! dependency target to the host and consults them on every propagated
//! change.
//!
//! A dependency with no comparison values makes the host unconditionally
//! dirty whenever the target changes. A dependency with comparison values
//! suppresses the host's notification when re-evaluating the list produces
//! element-wise equal comparisons: the target changed, but nothing the host
//! cares about did.
//!
//! Back-links live only while the host has at least one listener: the first
//! subscription wires them up, the last unsubscribe tears them down. The
//! list's shape must stay stable across evaluations; a length change (of
//! the list or of any entry's comparison values) is a fatal
//! [`TreeError::DependencyShape`].

use crate::{
    TreeRandomState, create_map,
    arena::NodeId,
    error::TreeError,
    tree::Tree,
    value::Value,
};
use std::{collections::HashMap, fmt, rc::Rc};

/// One declared dependency of a derived node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dependency {
    /// The watched node. `None` entries keep the list shape stable when a
    /// dependency is conditionally absent.
    pub node: Option<NodeId>,
    /// Memoized comparison values. `None` means "any change to the target
    /// counts"; `Some` suppresses notification while the values stay
    /// element-wise equal. The length must stay stable across evaluations.
    pub comparisons: Option<Vec<Value>>,
}

impl Dependency {
    /// Watches `node` unconditionally.
    pub fn on(node: NodeId) -> Self {
        Dependency {
            node: Some(node),
            comparisons: None,
        }
    }

    /// Watches `node`, but only counts as changed when `comparisons`
    /// differ from the previous evaluation.
    pub fn on_memoized(node: NodeId, comparisons: Vec<Value>) -> Self {
        Dependency {
            node: Some(node),
            comparisons: Some(comparisons),
        }
    }
}

type EvalFn = dyn Fn(&Tree) -> Vec<Dependency>;

struct Host {
    eval: Rc<EvalFn>,
    /// The last evaluated list; `Some` while the host is wired.
    prev: Option<Vec<Dependency>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct BackLink {
    host: NodeId,
    index: usize,
}

/// Dependent↔dependency bookkeeping, keyed by arena id and pruned
/// explicitly when nodes are released.
pub(crate) struct DepGraph {
    hosts: HashMap<NodeId, Host, TreeRandomState>,
    links: HashMap<NodeId, Vec<BackLink>, TreeRandomState>,
}

impl Default for DepGraph {
    fn default() -> Self {
        DepGraph {
            hosts: create_map(),
            links: create_map(),
        }
    }
}

impl fmt::Debug for DepGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepGraph")
            .field("hosts", &self.hosts.len())
            .field("targets", &self.links.len())
            .finish()
    }
}

impl DepGraph {
    fn add_link(&mut self, target: NodeId, link: BackLink) {
        self.links.entry(target).or_default().push(link);
    }

    fn remove_link(&mut self, target: NodeId, link: BackLink) {
        if let Some(links) = self.links.get_mut(&target) {
            links.retain(|l| *l != link);
            if links.is_empty() {
                self.links.remove(&target);
            }
        }
    }

    fn is_wired(&self, host: NodeId) -> bool {
        self.hosts.get(&host).is_some_and(|h| h.prev.is_some())
    }

    /// Drops every trace of `node`: its host registration and any back-link
    /// pointing at it or registered by it.
    pub(crate) fn prune(&mut self, node: NodeId) {
        if let Some(host) = self.hosts.remove(&node) {
            if let Some(prev) = host.prev {
                for (index, dep) in prev.iter().enumerate() {
                    if let Some(target) = dep.node {
                        self.remove_link(target, BackLink { host: node, index });
                    }
                }
            }
        }
        self.links.remove(&node);
    }
}

impl Tree {
    /// Declares `node` as a derived node whose dependency list is produced
    /// by `eval`.
    ///
    /// `eval` must be pure: it is re-evaluated on demand during change
    /// propagation and must return a list of stable shape. Back-links are
    /// wired as soon as the node has a listener (immediately, if it already
    /// has one).
    pub fn define_derived(
        &self,
        node: NodeId,
        eval: impl Fn(&Tree) -> Vec<Dependency> + 'static,
    ) -> Result<(), TreeError> {
        if !self.inner.arena.borrow().contains(node) {
            return Err(TreeError::NotAttached { node });
        }
        self.inner.deps.borrow_mut().hosts.insert(
            node,
            Host {
                eval: Rc::from(Box::new(eval) as Box<EvalFn>),
                prev: None,
            },
        );
        self.wire_host_if_needed(node)
    }

    /// Wires a declared host's back-links if it has listeners and is not
    /// wired yet. Called on subscription and on declaration.
    pub(crate) fn wire_host_if_needed(&self, node: NodeId) -> Result<(), TreeError> {
        let eval = {
            let deps = self.inner.deps.borrow();
            let listeners = self.inner.listeners.borrow();
            match deps.hosts.get(&node) {
                Some(host) if host.prev.is_none() && listeners.has_any(node) => {
                    Rc::clone(&host.eval)
                }
                _ => return Ok(()),
            }
        };
        let list = eval(self);
        let mut deps = self.inner.deps.borrow_mut();
        for (index, dep) in list.iter().enumerate() {
            if let Some(target) = dep.node {
                deps.add_link(target, BackLink { host: node, index });
            }
        }
        if let Some(host) = deps.hosts.get_mut(&node) {
            host.prev = Some(list);
        }
        Ok(())
    }

    /// Tears down a host's back-links. Called when its last listener goes
    /// away; the declaration itself stays, so a later subscription re-wires.
    pub(crate) fn unwire_host(&self, node: NodeId) {
        let mut deps = self.inner.deps.borrow_mut();
        let Some(host) = deps.hosts.get_mut(&node) else {
            return;
        };
        let Some(prev) = host.prev.take() else {
            return;
        };
        for (index, dep) in prev.iter().enumerate() {
            if let Some(target) = dep.node {
                deps.remove_link(target, BackLink { host: node, index });
            }
        }
    }

    /// Replaces a wired host's dependency list with `list`, diffing
    /// index-wise: each changed entry unsubscribes the old back-link and
    /// registers the new one. The shape must match the previous list.
    fn rewire_host(&self, node: NodeId, list: Vec<Dependency>) -> Result<(), TreeError> {
        let mut deps = self.inner.deps.borrow_mut();
        let Some(host) = deps.hosts.get(&node) else {
            return Ok(());
        };
        let Some(prev) = host.prev.clone() else {
            return Ok(());
        };
        if prev.len() != list.len() {
            return Err(TreeError::DependencyShape {
                host: node,
                expected: prev.len(),
                found: list.len(),
            });
        }
        for (index, (old, new)) in prev.iter().zip(list.iter()).enumerate() {
            if old.node != new.node {
                if let Some(target) = old.node {
                    deps.remove_link(target, BackLink { host: node, index });
                }
                if let Some(target) = new.node {
                    deps.add_link(target, BackLink { host: node, index });
                }
            }
        }
        if let Some(host) = deps.hosts.get_mut(&node) {
            host.prev = Some(list);
        }
        Ok(())
    }

    /// Consults the dependency graph after a leaf change at `changed`:
    /// re-wires `changed` itself if it is a live host, then runs the change
    /// notification path of every derived node whose watched dependency
    /// actually differs.
    pub(crate) fn notify_dependents(&self, changed: NodeId) -> Result<(), TreeError> {
        if self.inner.deps.borrow().is_wired(changed) {
            let eval = {
                let deps = self.inner.deps.borrow();
                Rc::clone(&deps.hosts[&changed].eval)
            };
            let list = eval(self);
            self.rewire_host(changed, list)?;
        }

        let links: Vec<BackLink> = self
            .inner
            .deps
            .borrow()
            .links
            .get(&changed)
            .cloned()
            .unwrap_or_default();
        for link in links {
            let Some((eval, prev_len, prev_cmp)) = ({
                let deps = self.inner.deps.borrow();
                deps.hosts.get(&link.host).and_then(|host| {
                    let prev = host.prev.as_ref()?;
                    let entry = prev.get(link.index)?;
                    Some((Rc::clone(&host.eval), prev.len(), entry.comparisons.clone()))
                })
            }) else {
                // Unwired by an earlier iteration of this loop.
                continue;
            };
            let dirty = match prev_cmp {
                None => true,
                Some(prev_vals) => {
                    let current = eval(self);
                    if current.len() != prev_len {
                        return Err(TreeError::DependencyShape {
                            host: link.host,
                            expected: prev_len,
                            found: current.len(),
                        });
                    }
                    let cur_vals = current[link.index]
                        .comparisons
                        .clone()
                        .ok_or(TreeError::DependencyShape {
                            host: link.host,
                            expected: prev_vals.len(),
                            found: 0,
                        })?;
                    if cur_vals.len() != prev_vals.len() {
                        return Err(TreeError::DependencyShape {
                            host: link.host,
                            expected: prev_vals.len(),
                            found: cur_vals.len(),
                        });
                    }
                    let differs = cur_vals != prev_vals;
                    if differs {
                        self.rewire_host(link.host, current)?;
                    }
                    differs
                }
            };
            if dirty {
                self.touch(link.host)?;
                self.propagate_change(link.host)?;
            }
        }
        Ok(())
    }
}
