// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Error taxonomy of the engine.
//!
//! Every variant is a programmer-error condition, raised synchronously at
//! the call site that violated an invariant. None of them are transient: the
//! engine never retries or suppresses them, and a failed write commits
//! nothing that a listener could observe.

use crate::arena::{ContainerKind, NodeId};
use std::fmt;

/// Error raised when the host misuses the tree API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A node was assigned under two simultaneous parents, attached beneath
    /// itself, or attached as a second root. Moving a node requires deleting
    /// it from its old location before (or within the same transaction as)
    /// attaching it to the new one.
    InvalidMove { node: NodeId },

    /// The id does not name a live node of this tree: it was never created
    /// here, or the node has since been released.
    NotAttached { node: NodeId },

    /// A derived node's dependency list changed shape between evaluations.
    /// Dependency lists must keep a stable length, and each entry's
    /// comparison list must keep a stable length, for the lifetime of the
    /// derived node.
    DependencyShape {
        host: NodeId,
        expected: usize,
        found: usize,
    },

    /// A map operation was applied to a list node or vice versa.
    KindMismatch {
        expected: ContainerKind,
        found: ContainerKind,
    },

    /// A list write named an index beyond the current length.
    OutOfBounds {
        node: NodeId,
        index: usize,
        len: usize,
    },

    /// An imported document's root was a primitive. Only objects and arrays
    /// have a node representation.
    ScalarDocument,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::InvalidMove { node } => {
                write!(f, "node {node} cannot be attached there: it already has a parent")
            }
            TreeError::NotAttached { node } => {
                write!(f, "node {node} is not attached to this tree")
            }
            TreeError::DependencyShape {
                host,
                expected,
                found,
            } => write!(
                f,
                "dependency list of derived node {host} changed shape: expected {expected} entries, found {found}"
            ),
            TreeError::KindMismatch { expected, found } => {
                write!(f, "expected a {expected} node, found a {found} node")
            }
            TreeError::OutOfBounds { node, index, len } => {
                write!(f, "index {index} out of bounds for list {node} of length {len}")
            }
            TreeError::ScalarDocument => {
                write!(f, "document root must be an object or an array")
            }
        }
    }
}

impl std::error::Error for TreeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_actionable() {
        let node = NodeId {
            index: 3,
            generation: 1,
        };
        assert_eq!(
            TreeError::NotAttached { node }.to_string(),
            "node 3v1 is not attached to this tree"
        );
        assert_eq!(
            TreeError::OutOfBounds {
                node,
                index: 5,
                len: 2
            }
            .to_string(),
            "index 5 out of bounds for list 3v1 of length 2"
        );
    }
}
