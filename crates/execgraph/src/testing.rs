//! Test doubles for code that plans or executes fragments.
//!
//! [`MockConnector`] keeps an in-memory filesystem per host and answers
//! every [`Connector`] primitive from it, so planners can be driven through
//! a full precheck/run cycle without touching the network or disk:
//!
//! ```
//! use execgraph::testing::MockConnector;
//! use execgraph::{Connector, Host};
//! use std::path::Path;
//!
//! let mock = MockConnector::new();
//! mock.serve("https://example.com/tool", b"binary".to_vec());
//!
//! let host = Host::local("control");
//! mock.download(&host, "https://example.com/tool", Path::new("/work/tool")).unwrap();
//! assert!(mock.exists(&host, Path::new("/work/tool")).unwrap());
//! ```
//!
//! Hosts whose address is local share one namespace, like they would on a
//! real machine. [`Noop`] and [`Scripted`] are minimal operations for graph
//! and executor tests.

use crate::context::{Connector, ExecContext};
use crate::digest::sha256_hex;
use crate::node::Operation;
use crate::types::{CommandOutput, Host, HostFacts, ServiceAction};
use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const LOCAL_NAMESPACE: &str = "localhost";

/// A file held by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub content: Vec<u8>,
    pub mode: u32,
}

/// Enablement and activity of a systemd unit on a mock host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub enabled: bool,
    pub active: bool,
}

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<(String, PathBuf), MockFile>,
    dirs: BTreeSet<(String, PathBuf)>,
    urls: HashMap<String, Vec<u8>>,
    archives: HashMap<String, Vec<(PathBuf, Vec<u8>)>>,
    facts: HashMap<String, HostFacts>,
    services: BTreeMap<(String, String), ServiceState>,
    responses: HashMap<String, CommandOutput>,
    failures: Vec<(Option<String>, String)>,
    commands: Vec<(String, String)>,
    downloads: Vec<String>,
    uploads: Vec<(String, PathBuf)>,
}

impl MockState {
    fn should_fail(&self, host: &Host, what: &str) -> bool {
        self.failures.iter().any(|(only, pattern)| {
            only.as_ref().is_none_or(|name| *name == host.name) && what.contains(pattern.as_str())
        })
    }
}

/// In-memory connector for tests.
#[derive(Debug)]
pub struct MockConnector {
    state: Mutex<MockState>,
    default_facts: HostFacts,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Create an empty mock whose hosts report `x86_64` / `Linux`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_facts("x86_64", "Linux")
    }

    /// Create an empty mock whose hosts report the given raw facts.
    #[must_use]
    pub fn with_facts(arch: &str, os: &str) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            default_facts: HostFacts {
                arch: arch.to_string(),
                os: os.to_string(),
            },
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn namespace(host: &Host) -> String {
        if host.is_local() {
            LOCAL_NAMESPACE.to_string()
        } else {
            host.name.clone()
        }
    }

    fn key(host: &Host, path: &Path) -> (String, PathBuf) {
        (Self::namespace(host), path.to_path_buf())
    }

    /// Override the facts a single host reports.
    pub fn set_facts(&self, host: &str, arch: &str, os: &str) {
        self.state().facts.insert(
            host.to_string(),
            HostFacts {
                arch: arch.to_string(),
                os: os.to_string(),
            },
        );
    }

    /// Make `url` downloadable with the given body.
    pub fn serve(&self, url: impl Into<String>, body: Vec<u8>) {
        self.state().urls.insert(url.into(), body);
    }

    /// Register what extracting an archive named `file_name` produces.
    ///
    /// Entry paths are relative to the extraction directory.
    pub fn add_archive<I, P>(&self, file_name: impl Into<String>, entries: I)
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: Into<PathBuf>,
    {
        let entries = entries
            .into_iter()
            .map(|(path, content)| (path.into(), content))
            .collect();
        self.state().archives.insert(file_name.into(), entries);
    }

    /// Place a file on a host with mode 0644.
    pub fn put_file(&self, host: &Host, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.put_file_with_mode(host, path, content, 0o644);
    }

    /// Place a file on a host with an explicit mode.
    pub fn put_file_with_mode(
        &self,
        host: &Host,
        path: impl AsRef<Path>,
        content: impl Into<Vec<u8>>,
        mode: u32,
    ) {
        self.state().files.insert(
            Self::key(host, path.as_ref()),
            MockFile {
                content: content.into(),
                mode,
            },
        );
    }

    /// Content of a file on a host.
    pub fn file(&self, host: &Host, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(&Self::key(host, path.as_ref()))
            .map(|f| f.content.clone())
    }

    /// Mode of a file on a host.
    pub fn mode(&self, host: &Host, path: impl AsRef<Path>) -> Option<u32> {
        self.state()
            .files
            .get(&Self::key(host, path.as_ref()))
            .map(|f| f.mode)
    }

    /// Paths of every file on a host.
    pub fn files_on(&self, host: &Host) -> Vec<PathBuf> {
        let namespace = Self::namespace(host);
        self.state()
            .files
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, path)| path.clone())
            .collect()
    }

    /// Return `output` whenever exactly `cmd` is run.
    pub fn respond(&self, cmd: impl Into<String>, output: CommandOutput) {
        self.state().responses.insert(cmd.into(), output);
    }

    /// Fail every command, download URL or upload destination containing
    /// `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state().failures.push((None, pattern.into()));
    }

    /// Like [`fail_on`](Self::fail_on), for the host named `host` only.
    pub fn fail_on_host(&self, host: impl Into<String>, pattern: impl Into<String>) {
        self.state()
            .failures
            .push((Some(host.into()), pattern.into()));
    }

    /// Every command run, on any host, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Commands run on one host, in order.
    pub fn commands_on(&self, host: &Host) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|(name, _)| *name == host.name)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// URLs downloaded, in order.
    pub fn downloads(&self) -> Vec<String> {
        self.state().downloads.clone()
    }

    /// Uploads performed as `(host name, remote path)`, in order.
    pub fn uploads(&self) -> Vec<(String, PathBuf)> {
        self.state().uploads.clone()
    }

    /// Current state of a unit on a host.
    pub fn service_state(&self, host: &Host, unit: &str) -> ServiceState {
        self.state()
            .services
            .get(&(host.name.clone(), unit.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn record(&self, host: &Host, cmd: String) {
        self.state().commands.push((host.name.clone(), cmd));
    }
}

impl Connector for MockConnector {
    fn exists(&self, host: &Host, path: &Path) -> Result<bool> {
        let namespace = Self::namespace(host);
        let state = self.state();
        let key = (namespace.clone(), path.to_path_buf());
        if state.files.contains_key(&key) || state.dirs.contains(&key) {
            return Ok(true);
        }
        Ok(state
            .files
            .keys()
            .any(|(ns, file)| *ns == namespace && file.starts_with(path)))
    }

    fn sha256(&self, host: &Host, path: &Path) -> Result<String> {
        let state = self.state();
        let file = state
            .files
            .get(&Self::key(host, path))
            .with_context(|| format!("No such file on {}: {}", host, path.display()))?;
        Ok(sha256_hex(&file.content))
    }

    fn download(&self, host: &Host, url: &str, dest: &Path) -> Result<()> {
        let mut state = self.state();
        if state.should_fail(host, url) {
            bail!("Download failed: {url}");
        }
        let Some(body) = state.urls.get(url).cloned() else {
            bail!("HTTP 404: {url}");
        };
        state.downloads.push(url.to_string());
        state.files.insert(
            Self::key(host, dest),
            MockFile {
                content: body,
                mode: 0o644,
            },
        );
        Ok(())
    }

    fn extract(&self, host: &Host, archive: &Path, dest_dir: &Path) -> Result<()> {
        let mut state = self.state();
        if !state.files.contains_key(&Self::key(host, archive)) {
            bail!("Archive not found on {}: {}", host, archive.display());
        }
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(entries) = state.archives.get(&file_name).cloned() else {
            bail!("Unrecognized archive: {file_name}");
        };
        state.dirs.insert(Self::key(host, dest_dir));
        for (relative, content) in entries {
            state.files.insert(
                Self::key(host, &dest_dir.join(relative)),
                MockFile {
                    content,
                    mode: 0o755,
                },
            );
        }
        Ok(())
    }

    fn run(&self, host: &Host, cmd: &str) -> Result<CommandOutput> {
        self.record(host, cmd.to_string());
        let state = self.state();
        if state.should_fail(host, cmd) {
            return Ok(CommandOutput::failed(format!("mock failure: {cmd}")));
        }
        Ok(state
            .responses
            .get(cmd)
            .cloned()
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn upload(&self, host: &Host, local: &Path, remote: &Path) -> Result<()> {
        let mut state = self.state();
        if state.should_fail(host, &remote.to_string_lossy()) {
            bail!("Upload to {} failed: {}", host, remote.display());
        }
        let source = state
            .files
            .get(&(LOCAL_NAMESPACE.to_string(), local.to_path_buf()))
            .cloned()
            .with_context(|| format!("No such local file: {}", local.display()))?;
        state.uploads.push((host.name.clone(), remote.to_path_buf()));
        state.files.insert(Self::key(host, remote), source);
        Ok(())
    }

    fn write_file(&self, host: &Host, content: &[u8], dest: &Path, mode: u32) -> Result<()> {
        let mut state = self.state();
        if state.should_fail(host, &dest.to_string_lossy()) {
            bail!("Write to {} failed: {}", host, dest.display());
        }
        state.files.insert(
            Self::key(host, dest),
            MockFile {
                content: content.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    fn copy(&self, host: &Host, src: &Path, dest: &Path) -> Result<()> {
        let mut state = self.state();
        let file = state
            .files
            .get(&Self::key(host, src))
            .cloned()
            .with_context(|| format!("No such file on {}: {}", host, src.display()))?;
        state.files.insert(Self::key(host, dest), file);
        Ok(())
    }

    fn chmod(&self, host: &Host, path: &Path, mode: u32) -> Result<()> {
        let mut state = self.state();
        let file = state
            .files
            .get_mut(&Self::key(host, path))
            .with_context(|| format!("No such file on {}: {}", host, path.display()))?;
        file.mode = mode;
        Ok(())
    }

    fn mkdir_all(&self, host: &Host, path: &Path) -> Result<()> {
        self.state().dirs.insert(Self::key(host, path));
        Ok(())
    }

    fn remove(&self, host: &Host, path: &Path) -> Result<()> {
        let namespace = Self::namespace(host);
        let mut state = self.state();
        state
            .files
            .retain(|(ns, file), _| !(*ns == namespace && file.starts_with(path)));
        state
            .dirs
            .retain(|(ns, dir)| !(*ns == namespace && dir.starts_with(path)));
        Ok(())
    }

    fn service(&self, host: &Host, unit: &str, action: ServiceAction) -> Result<()> {
        let cmd = match action {
            ServiceAction::DaemonReload => "systemctl daemon-reload".to_string(),
            other => format!("systemctl {} {}", other.verb(), unit),
        };
        self.record(host, cmd.clone());

        let mut state = self.state();
        if state.should_fail(host, &cmd) {
            bail!("Command failed on {host}: {cmd}");
        }
        let entry = state
            .services
            .entry((host.name.clone(), unit.to_string()))
            .or_default();
        match action {
            ServiceAction::DaemonReload => {}
            ServiceAction::Enable => entry.enabled = true,
            ServiceAction::Disable => entry.enabled = false,
            ServiceAction::Start | ServiceAction::Restart | ServiceAction::Reload => {
                entry.active = true;
            }
            ServiceAction::Stop => entry.active = false,
        }
        Ok(())
    }

    fn service_active(&self, host: &Host, unit: &str) -> Result<bool> {
        Ok(self.service_state(host, unit).active)
    }

    fn facts(&self, host: &Host) -> Result<HostFacts> {
        let state = self.state();
        if state.should_fail(host, "uname") {
            bail!("Failed to query facts of {host}");
        }
        Ok(state
            .facts
            .get(&host.name)
            .cloned()
            .unwrap_or_else(|| self.default_facts.clone()))
    }
}

/// Operation that is never satisfied and always succeeds.
///
/// The tag doubles as its fingerprint, so two `Noop`s with the same tag are
/// the same planning decision.
#[derive(Debug, Clone)]
pub struct Noop {
    tag: String,
}

impl Noop {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Operation for Noop {
    fn kind(&self) -> &'static str {
        "noop"
    }

    fn describe(&self) -> String {
        format!("noop {}", self.tag)
    }

    fn fingerprint(&self) -> String {
        self.tag.clone()
    }

    fn precheck(&self, _ctx: &ExecContext, _host: &Host) -> Result<bool> {
        Ok(false)
    }

    fn run(&self, _ctx: &ExecContext, _host: &Host) -> Result<()> {
        Ok(())
    }
}

/// Shared, ordered record of what scripted operations did.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Events recorded so far, e.g. `run:a@control`.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events of one kind (`run`, `rollback`), with the prefix stripped.
    pub fn of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{kind}:");
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

/// Configurable operation that records its calls into an [`EventLog`].
#[derive(Debug, Clone)]
pub struct Scripted {
    tag: String,
    log: EventLog,
    satisfied: bool,
    fail: bool,
    fail_rollback: bool,
    delay: Option<Duration>,
}

impl Scripted {
    pub fn new(tag: impl Into<String>, log: &EventLog) -> Self {
        Self {
            tag: tag.into(),
            log: log.clone(),
            satisfied: false,
            fail: false,
            fail_rollback: false,
            delay: None,
        }
    }

    /// Report the goal as already met.
    #[must_use]
    pub fn satisfied(mut self) -> Self {
        self.satisfied = true;
        self
    }

    /// Fail on run.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Fail on rollback.
    #[must_use]
    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Sleep before running.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Operation for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn describe(&self) -> String {
        format!("scripted {}", self.tag)
    }

    fn fingerprint(&self) -> String {
        self.tag.clone()
    }

    fn precheck(&self, _ctx: &ExecContext, _host: &Host) -> Result<bool> {
        Ok(self.satisfied)
    }

    fn run(&self, _ctx: &ExecContext, host: &Host) -> Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.log.push(format!("run:{}@{}", self.tag, host));
        if self.fail {
            bail!("scripted {} failed on {}", self.tag, host);
        }
        Ok(())
    }

    fn rollback(&self, _ctx: &ExecContext, host: &Host) -> Result<()> {
        self.log.push(format!("rollback:{}@{}", self.tag, host));
        if self.fail_rollback {
            bail!("scripted {} could not roll back on {}", self.tag, host);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hosts_share_a_namespace() {
        let mock = MockConnector::new();
        mock.put_file(&Host::local("control"), "/work/a", "x");
        assert!(mock.exists(&Host::new("other", "127.0.0.1"), Path::new("/work/a")).unwrap());
        assert!(!mock.exists(&Host::new("node1", "10.0.0.1"), Path::new("/work/a")).unwrap());
    }

    #[test]
    fn test_exists_matches_directory_prefix() {
        let mock = MockConnector::new();
        let host = Host::local("control");
        mock.put_file(&host, "/work/dir/file", "x");
        assert!(mock.exists(&host, Path::new("/work/dir")).unwrap());
        assert!(!mock.exists(&host, Path::new("/work/di")).unwrap());
    }

    #[test]
    fn test_download_unknown_url_fails() {
        let mock = MockConnector::new();
        let err = mock
            .download(&Host::local("c"), "https://nowhere", Path::new("/x"))
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_extract_writes_registered_entries() {
        let mock = MockConnector::new();
        let host = Host::local("control");
        mock.put_file(&host, "/work/tool.tar.gz", "archive");
        mock.add_archive("tool.tar.gz", [("tool/bin", b"bin".to_vec())]);

        mock.extract(&host, Path::new("/work/tool.tar.gz"), Path::new("/work/out"))
            .unwrap();
        assert_eq!(mock.file(&host, "/work/out/tool/bin"), Some(b"bin".to_vec()));
        assert_eq!(mock.mode(&host, "/work/out/tool/bin"), Some(0o755));
    }

    #[test]
    fn test_upload_copies_from_control_node() {
        let mock = MockConnector::new();
        let control = Host::local("control");
        let node = Host::new("node1", "10.0.0.1");
        mock.put_file_with_mode(&control, "/work/etcd", "bin", 0o755);

        mock.upload(&node, Path::new("/work/etcd"), Path::new("/tmp/etcd"))
            .unwrap();
        assert_eq!(mock.file(&node, "/tmp/etcd"), Some(b"bin".to_vec()));
        assert_eq!(mock.uploads(), vec![("node1".to_string(), PathBuf::from("/tmp/etcd"))]);
    }

    #[test]
    fn test_service_state_transitions() {
        let mock = MockConnector::new();
        let host = Host::new("node1", "10.0.0.1");
        mock.service(&host, "etcd", ServiceAction::Enable).unwrap();
        mock.service(&host, "etcd", ServiceAction::Restart).unwrap();
        assert_eq!(
            mock.service_state(&host, "etcd"),
            ServiceState {
                enabled: true,
                active: true
            }
        );
        assert!(mock.service_active(&host, "etcd").unwrap());
        assert_eq!(
            mock.commands_on(&host),
            vec!["systemctl enable etcd", "systemctl restart etcd"]
        );
    }

    #[test]
    fn test_fail_on_and_respond() {
        let mock = MockConnector::new();
        let host = Host::new("node1", "10.0.0.1");
        mock.fail_on("ctr");
        mock.respond("echo hi", CommandOutput::ok("hi\n"));

        assert!(!mock.run(&host, "ctr -n k8s.io images pull x").unwrap().success);
        assert_eq!(mock.run(&host, "echo hi").unwrap().stdout_str(), "hi\n");
        assert!(mock.run(&host, "true").unwrap().success);
    }

    #[test]
    fn test_fail_on_host_is_scoped() {
        let mock = MockConnector::new();
        let node1 = Host::new("node1", "10.0.0.1");
        let node2 = Host::new("node2", "10.0.0.2");
        mock.fail_on_host("node1", "/etc/app.conf");

        assert!(mock.write_file(&node1, b"x", Path::new("/etc/app.conf"), 0o644).is_err());
        mock.write_file(&node2, b"x", Path::new("/etc/app.conf"), 0o644)
            .unwrap();
        assert_eq!(mock.file(&node2, "/etc/app.conf"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_remove_deletes_tree() {
        let mock = MockConnector::new();
        let host = Host::local("control");
        mock.put_file(&host, "/work/x/a", "1");
        mock.put_file(&host, "/work/x/b/c", "2");
        mock.put_file(&host, "/work/y", "3");
        mock.remove(&host, Path::new("/work/x")).unwrap();
        assert_eq!(mock.files_on(&host), vec![PathBuf::from("/work/y")]);
    }

    #[test]
    fn test_facts_default_and_override() {
        let mock = MockConnector::with_facts("aarch64", "Linux");
        mock.set_facts("node2", "x86_64", "Linux");
        assert_eq!(mock.facts(&Host::local("control")).unwrap().arch, "aarch64");
        assert_eq!(mock.facts(&Host::new("node2", "10.0.0.2")).unwrap().arch, "x86_64");
    }

    #[test]
    fn test_scripted_records_events() {
        let log = EventLog::new();
        let mock = MockConnector::new();
        let ctx = ExecContext::new(&mock);
        let host = Host::local("control");
        let scripted = Scripted::new("a", &log).failing();
        assert!(scripted.run(&ctx, &host).is_err());
        scripted.rollback(&ctx, &host).unwrap();
        assert_eq!(log.events(), vec!["run:a@control", "rollback:a@control"]);
        assert_eq!(log.of("run"), vec!["a@control"]);
    }
}
