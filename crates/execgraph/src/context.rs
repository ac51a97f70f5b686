//! Execution context and provider traits
//!
//! These traits allow operations and the executor to be used without
//! depending on a specific transport, UI or progress implementation.

use crate::node::NodeId;
use crate::types::{CommandOutput, Host, HostFacts, NodeOutcome, ServiceAction};
use anyhow::{Context, Result, bail};
use std::path::Path;

/// Host primitives every operation is written against
///
/// Implement this trait to provide a transport (local process, ssh, an
/// agent, a test double). Only `exists`, `sha256`, `download`, `extract`,
/// `run`, `upload` and `write_file` are required; the remaining helpers
/// default to shell commands issued through [`Connector::run`].
pub trait Connector: Send + Sync {
    /// Check whether a file or directory exists on the host
    fn exists(&self, host: &Host, path: &Path) -> Result<bool>;

    /// Hex-encoded SHA-256 digest of a file on the host
    fn sha256(&self, host: &Host, path: &Path) -> Result<String>;

    /// Download `url` to `dest` on the host, creating parent directories
    fn download(&self, host: &Host, url: &str, dest: &Path) -> Result<()>;

    /// Unpack an archive (tar.gz, tgz, tar, zip) into `dest_dir` on the host
    fn extract(&self, host: &Host, archive: &Path, dest_dir: &Path) -> Result<()>;

    /// Run a shell command on the host
    fn run(&self, host: &Host, cmd: &str) -> Result<CommandOutput>;

    /// Copy a file from the control node to `remote` on the host
    fn upload(&self, host: &Host, local: &Path, remote: &Path) -> Result<()>;

    /// Write `content` to `dest` on the host with the given mode
    fn write_file(&self, host: &Host, content: &[u8], dest: &Path, mode: u32) -> Result<()>;

    /// Run a command and fail unless it exits successfully
    fn run_checked(&self, host: &Host, cmd: &str) -> Result<String> {
        let output = self.run(host, cmd)?;
        if !output.success {
            bail!(
                "Command failed on {}: {}: {}",
                host,
                cmd,
                output.stderr_str().trim()
            );
        }
        Ok(output.stdout_str())
    }

    /// Copy a file within the host
    fn copy(&self, host: &Host, src: &Path, dest: &Path) -> Result<()> {
        self.run_checked(host, &format!("cp -f {} {}", quote(src), quote(dest)))
            .map(|_| ())
    }

    /// Change the mode of a file on the host
    fn chmod(&self, host: &Host, path: &Path, mode: u32) -> Result<()> {
        self.run_checked(host, &format!("chmod {:o} {}", mode, quote(path)))
            .map(|_| ())
    }

    /// Create a directory and its parents on the host
    fn mkdir_all(&self, host: &Host, path: &Path) -> Result<()> {
        self.run_checked(host, &format!("mkdir -p {}", quote(path)))
            .map(|_| ())
    }

    /// Remove a file or directory tree on the host
    fn remove(&self, host: &Host, path: &Path) -> Result<()> {
        self.run_checked(host, &format!("rm -rf {}", quote(path)))
            .map(|_| ())
    }

    /// Drive a systemd unit through a lifecycle action
    fn service(&self, host: &Host, unit: &str, action: ServiceAction) -> Result<()> {
        let cmd = match action {
            ServiceAction::DaemonReload => "systemctl daemon-reload".to_string(),
            other => format!("systemctl {} {}", other.verb(), unit),
        };
        self.run_checked(host, &cmd).map(|_| ())
    }

    /// Whether a systemd unit is currently active
    fn service_active(&self, host: &Host, unit: &str) -> Result<bool> {
        Ok(self
            .run(host, &format!("systemctl is-active --quiet {unit}"))?
            .success)
    }

    /// Raw architecture and kernel name of the host
    fn facts(&self, host: &Host) -> Result<HostFacts> {
        let arch = self
            .run_checked(host, "uname -m")
            .with_context(|| format!("Failed to query architecture of {host}"))?;
        let os = self
            .run_checked(host, "uname -s")
            .with_context(|| format!("Failed to query kernel name of {host}"))?;
        Ok(HostFacts {
            arch: arch.trim().to_string(),
            os: os.trim().to_string(),
        })
    }
}

/// Quote a path for use in a POSIX shell command.
pub fn quote(path: &Path) -> String {
    quote_str(&path.to_string_lossy())
}

/// Quote an arbitrary argument for use in a POSIX shell command.
pub fn quote_str(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Context passed to every operation call
pub struct ExecContext<'a> {
    /// Transport used to reach hosts
    pub connector: &'a dyn Connector,
    /// Whether to output verbose information
    pub verbose: bool,
}

impl<'a> ExecContext<'a> {
    /// Create a new execution context
    pub fn new(connector: &'a dyn Connector) -> Self {
        Self {
            connector,
            verbose: false,
        }
    }
}

/// Progress callback for execution
///
/// Implement this trait to receive progress updates during execution.
/// Callbacks are always invoked from the coordinating thread.
pub trait ProgressCallback: Send {
    /// Called once before any node starts
    fn on_start(&mut self, total: usize);

    /// Called when a node is handed to a worker
    fn on_node_start(&mut self, id: &NodeId, name: &str);

    /// Called when a node reaches its final outcome
    fn on_node_complete(&mut self, id: &NodeId, outcome: &NodeOutcome);

    /// Called when a completed node is rolled back
    fn on_rollback(&mut self, _id: &NodeId) {}

    /// Called once after the last node
    fn on_finish(&mut self) {}
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_start(&mut self, _total: usize) {}
    fn on_node_start(&mut self, _id: &NodeId, _name: &str) {}
    fn on_node_complete(&mut self, _id: &NodeId, _outcome: &NodeOutcome) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Connector that only implements the required primitives, so the
    /// default helpers are exercised as written.
    #[derive(Default)]
    struct ScriptedConnector {
        commands: Mutex<Vec<String>>,
    }

    impl Connector for ScriptedConnector {
        fn exists(&self, _host: &Host, _path: &Path) -> Result<bool> {
            Ok(false)
        }

        fn sha256(&self, _host: &Host, _path: &Path) -> Result<String> {
            bail!("not scripted")
        }

        fn download(&self, _host: &Host, _url: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        fn extract(&self, _host: &Host, _archive: &Path, _dest_dir: &Path) -> Result<()> {
            Ok(())
        }

        fn run(&self, _host: &Host, cmd: &str) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(cmd.to_string());
            Ok(match cmd {
                "uname -m" => CommandOutput::ok("aarch64\n"),
                "uname -s" => CommandOutput::ok("Linux\n"),
                "false" => CommandOutput::failed("nope"),
                _ => CommandOutput::ok(""),
            })
        }

        fn upload(&self, _host: &Host, _local: &Path, _remote: &Path) -> Result<()> {
            Ok(())
        }

        fn write_file(&self, _host: &Host, _content: &[u8], _dest: &Path, _mode: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_quote_plain_path() {
        assert_eq!(quote(Path::new("/usr/local/bin/etcd")), "/usr/local/bin/etcd");
    }

    #[test]
    fn test_quote_path_with_spaces_and_quotes() {
        assert_eq!(quote(Path::new("/tmp/a b")), "'/tmp/a b'");
        assert_eq!(quote(Path::new("/tmp/it's")), r"'/tmp/it'\''s'");
    }

    #[test]
    fn test_quote_str_arguments() {
        assert_eq!(quote_str("/CN=etcd-ca"), "/CN=etcd-ca");
        assert_eq!(quote_str(""), "''");
        assert_eq!(quote_str("/CN=o'brien"), r"'/CN=o'\''brien'");
    }

    #[test]
    fn test_default_facts_use_uname() {
        let connector = ScriptedConnector::default();
        let facts = connector.facts(&Host::new("node1", "10.0.0.1")).unwrap();
        assert_eq!(facts.arch, "aarch64");
        assert_eq!(facts.os, "Linux");
    }

    #[test]
    fn test_default_helpers_issue_shell_commands() {
        let connector = ScriptedConnector::default();
        let host = Host::new("node1", "10.0.0.1");
        connector.chmod(&host, Path::new("/usr/local/bin/etcd"), 0o755).unwrap();
        connector.service(&host, "etcd", ServiceAction::DaemonReload).unwrap();
        connector.service(&host, "etcd", ServiceAction::Enable).unwrap();

        let commands = connector.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "chmod 755 /usr/local/bin/etcd",
                "systemctl daemon-reload",
                "systemctl enable etcd",
            ]
        );
    }

    #[test]
    fn test_run_checked_reports_stderr() {
        let connector = ScriptedConnector::default();
        let host = Host::new("node1", "10.0.0.1");

        let err = connector.run_checked(&host, "false").unwrap_err().to_string();
        assert!(err.contains("node1"));
        assert!(err.contains("nope"));
    }

    #[test]
    fn test_exec_context_defaults() {
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        assert!(!ctx.verbose);
        assert!(!ctx.connector.exists(&Host::local("c"), &PathBuf::from("/x")).unwrap());
    }
}
