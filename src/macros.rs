// (c) Copyright 2025 Helsing GmbH. All rights reserved.
/// Convenience macro for building a detached subtree in one expression.
///
/// NOTE! This is mostly useful for tests and initialization. Construction
/// happens on freshly created nodes, so the fallible engine calls inside
/// cannot actually fail.
///
/// Map literal (note the '{' and '}'):
/// ```rust
/// # use obtree::{node_literal, Tree};
/// let tree = Tree::new();
/// let node = node_literal!(tree, {
///     "title" => "groceries",
///     "done" => false
/// });
/// ```
///
/// List literal (note the '[' and ']'):
/// ```rust
/// # use obtree::{node_literal, Tree};
/// let tree = Tree::new();
/// let node = node_literal!(tree, ["milk", "eggs"]);
/// ```
///
/// Literals nest, and structured children become linked nodes:
/// ```rust
/// # use obtree::{node_literal, Tree};
/// let tree = Tree::new();
/// let node = node_literal!(tree, {
///     "title" => "groceries",
///     "items" => [
///         { "name" => "milk", "bought" => true },
///         { "name" => "eggs", "bought" => false }
///     ]
/// });
/// ```
#[macro_export]
macro_rules! node_literal {
    ($tree:expr, { $($k:literal => $v:tt),* $(,)? }) => {
        {
            let tree = &$tree;
            let node = tree.new_map();
            $( $crate::node_literal!(@field tree, node, $k, $v); )*
            node
        }
    };

    ($tree:expr, [ $($v:tt),* $(,)? ]) => {
        {
            let tree = &$tree;
            let node = tree.new_list();
            $( $crate::node_literal!(@item tree, node, $v); )*
            node
        }
    };

    // Helpers for map fields
    (@field $tree:ident, $node:ident, $k:literal, { $($ik:literal => $iv:tt),* $(,)? }) => {
        let child = $crate::node_literal!($tree, { $($ik => $iv),* });
        $tree
            .set($node, $k, $crate::Value::Node(child))
            .expect("fresh child has no other parent");
    };
    (@field $tree:ident, $node:ident, $k:literal, [ $($iv:tt),* $(,)? ]) => {
        let child = $crate::node_literal!($tree, [ $($iv),* ]);
        $tree
            .set($node, $k, $crate::Value::Node(child))
            .expect("fresh child has no other parent");
    };
    (@field $tree:ident, $node:ident, $k:literal, $v:expr) => {
        $tree
            .set($node, $k, $crate::Value::from($v))
            .expect("fresh map accepts any field");
    };

    // Helpers for list items
    (@item $tree:ident, $node:ident, { $($ik:literal => $iv:tt),* $(,)? }) => {
        let child = $crate::node_literal!($tree, { $($ik => $iv),* });
        $tree
            .push($node, $crate::Value::Node(child))
            .expect("fresh child has no other parent");
    };
    (@item $tree:ident, $node:ident, [ $($iv:tt),* $(,)? ]) => {
        let child = $crate::node_literal!($tree, [ $($iv),* ]);
        $tree
            .push($node, $crate::Value::Node(child))
            .expect("fresh child has no other parent");
    };
    (@item $tree:ident, $node:ident, $v:expr) => {
        $tree
            .push($node, $crate::Value::from($v))
            .expect("fresh list accepts a push");
    };
}

/// Convenience macro for creating a whole tree with an attached root.
///
/// Expands to a `(tree, root)` pair. Construction is detached, so no
/// listener can observe a partially built document.
///
/// ```rust
/// # use obtree::tree_literal;
/// let (tree, root) = tree_literal! {
///     "app" => { "version" => 3 },
///     "users" => ["alice", "bob"]
/// };
/// assert_eq!(tree.get(root, "app").unwrap().and_then(|v| v.as_node()).is_some(), true);
/// ```
#[macro_export]
macro_rules! tree_literal {
    ($($k:literal => $v:tt),* $(,)?) => {
        {
            let tree = $crate::Tree::new();
            let root = $crate::node_literal!(tree, { $($k => $v),* });
            tree.attach_root(root).expect("fresh tree has no root yet");
            (tree, root)
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::{ContainerKind, Value};

    #[test]
    fn node_literal_macro() {
        let tree = crate::Tree::new();
        let node = node_literal!(tree, {
            "title" => "groceries",
            "count" => 2,
            "items" => [
                { "name" => "milk" },
                { "name" => "eggs" }
            ]
        });
        assert_eq!(
            tree.get(node, "title").unwrap(),
            Some(Value::from("groceries"))
        );
        let items = tree.get(node, "items").unwrap().unwrap().as_node().unwrap();
        assert_eq!(tree.kind(items).unwrap(), ContainerKind::List);
        assert_eq!(tree.len(items).unwrap(), 2);
        let first = tree.get(items, 0).unwrap().unwrap().as_node().unwrap();
        assert_eq!(tree.get(first, "name").unwrap(), Some(Value::from("milk")));
        assert_eq!(tree.parent_of(first).unwrap(), Some(items));
        assert_eq!(tree.parent_of(items).unwrap(), Some(node));
    }

    #[test]
    fn tree_literal_macro() {
        let (tree, root) = tree_literal! {
            "app" => { "version" => 3 },
            "flags" => [true, false]
        };
        assert_eq!(tree.parent_of(root).unwrap(), None);
        let app = tree.get(root, "app").unwrap().unwrap().as_node().unwrap();
        assert_eq!(tree.get(app, "version").unwrap(), Some(Value::I64(3)));
    }

    #[test]
    fn literal_construction_is_unobserved() {
        let (tree, root) = tree_literal! { "seed" => 1 };
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let sink = fired.clone();
        tree.on_subtree_changed(root, move |_| sink.set(sink.get() + 1))
            .unwrap();

        // building a detached literal notifies nobody
        let detached = node_literal!(tree, { "quiet" => true });
        assert_eq!(fired.get(), 0);

        tree.set(root, "loud", Value::Node(detached)).unwrap();
        assert_eq!(fired.get(), 1);
    }
}
