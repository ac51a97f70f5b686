//! Core types shared by planners, operations and the executor

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::process::Output;

/// A machine operations can target.
///
/// Hosts are identified by name: two hosts with the same name are the
/// same machine, whatever roles they were selected through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Inventory name (unique within a cluster)
    pub name: String,
    /// Address used by the transport
    #[serde(default)]
    pub address: String,
    /// Login user for remote transports
    #[serde(default)]
    pub user: Option<String>,
    /// Port for remote transports
    #[serde(default)]
    pub port: Option<u16>,
    /// Roles this host plays (e.g. "etcd", "control-plane", "worker")
    #[serde(default)]
    pub roles: Vec<String>,
    /// Architecture, if known up front
    #[serde(default)]
    pub arch: Option<String>,
    /// Operating system, if known up front
    #[serde(default)]
    pub os: Option<String>,
}

impl Host {
    /// Create a host reachable at `address`.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: None,
            port: None,
            roles: Vec::new(),
            arch: None,
            os: None,
        }
    }

    /// Create the local host (the control node in most setups).
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, "localhost")
    }

    /// Add roles to this host.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Pin the architecture of this host.
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Pin the operating system of this host.
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    /// Whether commands for this host run on the current machine.
    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "" | "localhost" | "127.0.0.1" | "::1")
    }

    /// Whether this host plays `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// `user@address` form used by ssh-style transports.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl PartialOrd for Host {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Host {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Raw platform facts reported by a host, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    /// Machine architecture as reported (e.g. "x86_64", "aarch64")
    pub arch: String,
    /// Kernel name as reported (e.g. "Linux")
    pub os: String,
}

/// Service lifecycle actions a connector must support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceAction {
    DaemonReload,
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceAction {
    /// The systemctl verb for this action.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::DaemonReload => "daemon-reload",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
        }
    }
}

/// Output from a command run on a host
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
        }
    }
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            success: true,
        }
    }

    /// A failed output with the given stderr.
    pub fn failed(stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            success: false,
        }
    }

    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Final state of one node after execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOutcome {
    /// Precheck reported the goal already met on every host
    Satisfied,
    /// The node ran on at least one host
    Changed,
    /// Dry run: the node would run on at least one host
    WouldChange,
    /// The node failed
    Failed { error: String },
    /// A dependency failed, so the node never started
    Blocked,
    /// Execution was cancelled before the node started
    Cancelled,
}

impl NodeOutcome {
    /// Whether dependents of this node may start.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Satisfied | Self::Changed | Self::WouldChange)
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub changed: usize,
    pub satisfied: usize,
    pub would_change: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub rolled_back: usize,
}

impl ExecuteSummary {
    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.cancelled == 0
    }

    /// Total number of nodes accounted for
    pub fn total(&self) -> usize {
        self.changed
            + self.satisfied
            + self.would_change
            + self.failed
            + self.blocked
            + self.cancelled
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &NodeOutcome) {
        match outcome {
            NodeOutcome::Satisfied => self.satisfied += 1,
            NodeOutcome::Changed => self.changed += 1,
            NodeOutcome::WouldChange => self.would_change += 1,
            NodeOutcome::Failed { .. } => self.failed += 1,
            NodeOutcome::Blocked => self.blocked += 1,
            NodeOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Only run prechecks and report what would change
    pub dry_run: bool,
    /// Number of concurrent workers
    pub jobs: usize,
    /// Verbose output
    pub verbose: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            verbose: false,
        }
    }
}
