//! Planning errors raised while building or composing fragments.
//!
//! These are always fatal to the planning call that produced them: a
//! fragment that fails validation is never handed to an executor.

use crate::node::NodeId;
use thiserror::Error;

/// Result type alias for graph construction.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while constructing, merging or chaining fragments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The same identifier was added twice to one builder.
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),

    /// Two fragments define the same identifier with different contents.
    #[error("node {id} is defined differently by the merged fragments")]
    Collision {
        /// Identifier defined by both operands.
        id: NodeId,
    },

    /// A node depends on an identifier that is not part of the fragment.
    #[error("node {node} depends on {dependency}, which is not in the fragment")]
    DanglingDependency {
        /// Node declaring the dependency.
        node: NodeId,
        /// Missing dependency.
        dependency: NodeId,
    },

    /// An edge names a node that is not part of the fragment.
    #[error("node {0} is not in the fragment")]
    UnknownNode(NodeId),

    /// The dependency relation is not acyclic.
    #[error("dependency cycle through node {0}")]
    Cycle(NodeId),

    /// A node targets no host at all.
    #[error("node {0} has no target host")]
    NoHosts(NodeId),

    /// The fragment has nodes but no entry or exit node.
    #[error("fragment has {nodes} nodes but an empty {boundary} set")]
    MissingBoundary {
        /// Number of nodes in the rejected fragment.
        nodes: usize,
        /// Which boundary set was empty ("entry" or "exit").
        boundary: &'static str,
    },
}
