//! Execution nodes and the operation contract
//!
//! An operation is the payload of a node. Every operation implements the
//! same three-phase contract, which is what lets planners and executors
//! stay idempotent without any persisted bookkeeping:
//!
//! - `precheck` inspects the host and reports whether the goal is met
//! - `run` performs the side effect, and is safe to call again
//! - `rollback` is a best-effort undo used when a later node fails

use crate::context::ExecContext;
use crate::types::Host;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Fragment-unique identifier of a node.
///
/// Planners derive ids from the decision they represent
/// (`download:<path>`, `service:etcd:node1`), so two planners that decide
/// the same thing produce the same id and merging collapses them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create an id from any string token.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a `<kind>:<subject>` id.
    pub fn derive(kind: &str, subject: impl fmt::Display) -> Self {
        Self(format!("{kind}:{subject}"))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Core trait for every operation a node can carry
///
/// # Example
///
/// ```ignore
/// use execgraph::{ExecContext, Host, Operation};
///
/// #[derive(Debug)]
/// struct EnsureDir { path: std::path::PathBuf }
///
/// impl Operation for EnsureDir {
///     fn kind(&self) -> &'static str { "ensure_dir" }
///     fn describe(&self) -> String { format!("Create {}", self.path.display()) }
///     fn fingerprint(&self) -> String { self.path.display().to_string() }
///
///     fn precheck(&self, ctx: &ExecContext, host: &Host) -> anyhow::Result<bool> {
///         ctx.connector.exists(host, &self.path)
///     }
///
///     fn run(&self, ctx: &ExecContext, host: &Host) -> anyhow::Result<()> {
///         ctx.connector.mkdir_all(host, &self.path)
///     }
/// }
/// ```
pub trait Operation: Send + Sync + fmt::Debug {
    /// Operation category (e.g. "download", "extract", "service")
    fn kind(&self) -> &'static str;

    /// Human-readable description
    fn describe(&self) -> String;

    /// Stable identity of the payload
    ///
    /// Two operations of the same kind with equal fingerprints must do
    /// exactly the same thing. Fragment merge relies on this to collapse
    /// duplicate planning decisions.
    fn fingerprint(&self) -> String;

    /// Report whether the goal is already met on `host`
    ///
    /// Must not have side effects.
    fn precheck(&self, ctx: &ExecContext, host: &Host) -> Result<bool>;

    /// Perform the operation on `host`
    ///
    /// Must be safe to call even when `precheck` reported satisfied.
    fn run(&self, ctx: &ExecContext, host: &Host) -> Result<()>;

    /// Best-effort undo of `run` on `host`
    ///
    /// Failures are logged by the executor and never propagated.
    fn rollback(&self, _ctx: &ExecContext, _host: &Host) -> Result<()> {
        Ok(())
    }
}

/// One operation bound to its target hosts and dependencies.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    name: String,
    op: Arc<dyn Operation>,
    hosts: Vec<Host>,
    dependencies: BTreeSet<NodeId>,
}

impl ExecutionNode {
    /// Create a node with no dependencies.
    ///
    /// Hosts are sorted and deduplicated by name.
    pub fn new<O, I>(name: impl Into<String>, op: O, hosts: I) -> Self
    where
        O: Operation + 'static,
        I: IntoIterator<Item = Host>,
    {
        Self::from_arc(name, Arc::new(op), hosts)
    }

    /// Create a node around an already shared operation.
    pub fn from_arc<I>(name: impl Into<String>, op: Arc<dyn Operation>, hosts: I) -> Self
    where
        I: IntoIterator<Item = Host>,
    {
        let mut hosts: Vec<Host> = hosts.into_iter().collect();
        hosts.sort();
        hosts.dedup();
        Self {
            name: name.into(),
            op,
            hosts,
            dependencies: BTreeSet::new(),
        }
    }

    /// Add dependencies to this node.
    pub fn depends_on<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.dependencies.extend(ids);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &dyn Operation {
        self.op.as_ref()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn dependencies(&self) -> &BTreeSet<NodeId> {
        &self.dependencies
    }

    pub(crate) fn add_dependencies<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        self.dependencies.extend(ids.into_iter().cloned());
    }

    /// Whether two nodes represent the same planning decision.
    ///
    /// Same payload identity (kind and fingerprint), same hosts and same
    /// dependencies. The display name is not part of the identity.
    pub fn same_decision(&self, other: &Self) -> bool {
        self.op.kind() == other.op.kind()
            && self.op.fingerprint() == other.op.fingerprint()
            && self.hosts == other.hosts
            && self.dependencies == other.dependencies
    }
}
