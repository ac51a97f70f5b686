//! # execgraph
//!
//! Execution graphs of idempotent operations.
//!
//! This crate provides the core abstractions for describing work as a
//! dependency-ordered graph, composing graphs produced by independent
//! planners, and running them against a fleet of hosts.
//!
//! ## Core Concepts
//!
//! - **Operation**: One unit of work with a precheck/run/rollback contract
//! - **ExecutionNode**: An operation bound to hosts, with dependencies
//! - **Fragment**: A validated acyclic subgraph with entry and exit sets
//! - **Connector**: The host primitives operations are written against
//! - **Executor**: Runs a fragment concurrently in dependency order
//!
//! ## Example
//!
//! ```ignore
//! use execgraph::{
//!     ExecContext, ExecuteOptions, ExecutionNode, FragmentBuilder, Host,
//!     NodeId, Operation, CancelToken, NoProgress, execute,
//! };
//!
//! #[derive(Debug)]
//! struct Touch { path: std::path::PathBuf }
//!
//! impl Operation for Touch {
//!     fn kind(&self) -> &'static str { "touch" }
//!     fn describe(&self) -> String { format!("Touch {}", self.path.display()) }
//!     fn fingerprint(&self) -> String { self.path.display().to_string() }
//!
//!     fn precheck(&self, ctx: &ExecContext, host: &Host) -> anyhow::Result<bool> {
//!         ctx.connector.exists(host, &self.path)
//!     }
//!
//!     fn run(&self, ctx: &ExecContext, host: &Host) -> anyhow::Result<()> {
//!         ctx.connector.write_file(host, b"", &self.path, 0o644)
//!     }
//! }
//!
//! let host = Host::local("control");
//! let mut builder = FragmentBuilder::new();
//! builder.add(
//!     NodeId::from("touch:/tmp/ready"),
//!     ExecutionNode::new("touch ready", Touch { path: "/tmp/ready".into() }, [host]),
//! )?;
//! let fragment = builder.build()?;
//!
//! let report = execute(&fragment, &connector, &ExecuteOptions::default(),
//!     &CancelToken::new(), &mut NoProgress)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`Connector`]: Runs primitives (files, commands, services) on a host
//! - [`ProgressCallback`]: Receives progress updates during execution
//!
//! Operations only ever talk to hosts through a [`Connector`], so the
//! same graph can be executed for real, against an SSH transport, or
//! against the in-memory `testing::MockConnector` (enabled by the
//! `testing` feature).

pub mod context;
pub mod digest;
pub mod error;
pub mod executor;
pub mod fragment;
pub mod node;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

// Re-export main types at crate root
pub use context::{Connector, ExecContext, NoProgress, ProgressCallback};
pub use error::{GraphError, Result};
pub use executor::{CancelToken, ExecutionReport, execute};
pub use fragment::{Fragment, FragmentBuilder, chain, link, merge, merge_all};
pub use node::{ExecutionNode, NodeId, Operation};
pub use types::{
    CommandOutput, ExecuteOptions, ExecuteSummary, Host, HostFacts, NodeOutcome, ServiceAction,
};
