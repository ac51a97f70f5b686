//! Task composition
//!
//! A task is one component installed on the hosts of its roles. The
//! [`TaskComposer`] turns a task into a single fragment:
//!
//! ```text
//!   control node                      target hosts
//!   ────────────                      ────────────
//!   download ─▶ extract ─▶ finalize ─┬─▶ upload ─▶ install ─▶ configure ─▶ service   (node1)
//!   ca ─▶ cert ──────────────────────┼─▶ upload ─▶ install ─▶ configure ─▶ service   (node2)
//!                                    └─▶ upload ─▶ install ─▶ configure ─▶ service   (node3)
//!   pull (node1)   pull (node2)   pull (node3)                                       (images)
//! ```
//!
//! Acquisition runs once on the control node per target platform and
//! every per-host chain waits for all of it. Chains of different hosts
//! share no edges. Image pulls are merged in without any ordering inside
//! their task.
//!
//! Across tasks, [`plan_cluster`] only adds the edges a task asks for with
//! [`ComponentTask::runs_after`]: its first steps on a host wait for the
//! named component's service on that same host.

mod containerd;
mod etcd;
mod images;
mod kubernetes;
pub mod ops;
mod pki;

pub use containerd::ContainerdTask;
pub use etcd::EtcdTask;
pub use images::ImageTask;
pub use kubernetes::KubeNodeTask;

use crate::config::ClusterConfig;
use crate::inventory::Inventory;
use anyhow::{Context, Result};
use artifacts::platform::{normalize_arch, normalize_os};
use artifacts::{Handle, Placement, Platform, PlanningSession, ResourceHandle};
use execgraph::digest::sha256_hex;
use execgraph::{
    ExecutionNode, Fragment, FragmentBuilder, Host, NodeId, Operation, chain, link, merge, merge_all,
};
use minijinja::{Environment, UndefinedBehavior};
use ops::{EnableService, Install, InstallFiles, RenderFiles, RenderedFile, Transfer, UploadFiles};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Where installed binaries go on target hosts.
pub const BIN_DIR: &str = "/usr/local/bin";

/// Where systemd units are written on target hosts.
pub const UNIT_DIR: &str = "/etc/systemd/system";

/// Operating system of target hosts that do not pin one.
pub const TARGET_OS: &str = "linux";

/// A component installed on the hosts of some roles.
pub trait ComponentTask {
    /// Component name, used in node ids and staging paths.
    fn component(&self) -> &str;

    /// Roles whose hosts receive the component.
    fn roles(&self) -> &[String];

    /// Artifacts needed by `hosts`, which all share `platform`.
    fn handles(
        &self,
        session: &PlanningSession,
        platform: &Platform,
        hosts: &[Host],
    ) -> Result<Vec<Handle>>;

    /// Components whose service must be up on a host before this task
    /// starts on that host.
    fn runs_after(&self) -> Vec<String> {
        Vec::new()
    }

    /// Control-node work every host needs besides artifacts (PKI).
    fn prerequisites(&self, _session: &PlanningSession, _hosts: &[Host]) -> Result<Fragment> {
        Ok(Fragment::empty())
    }

    /// Per-host steps for `host`. `members` is every target host of the task.
    fn host_plan(
        &self,
        session: &PlanningSession,
        host: &Host,
        handles: &[Handle],
        members: &[Host],
    ) -> Result<HostPlan>;
}

/// The per-host chain: upload, install, configure, service.
///
/// Missing stages are skipped; the remaining ones still run in order.
#[derive(Debug, Default)]
pub struct HostPlan {
    pub upload: Option<UploadFiles>,
    pub install: Option<InstallFiles>,
    pub configure: Option<RenderFiles>,
    pub service: Option<EnableService>,
}

impl HostPlan {
    /// Upload and install every file-backed handle into `BIN_DIR`.
    pub fn binaries(session: &PlanningSession, component: &str, handles: &[Handle]) -> Result<Self> {
        let mut plan = Self::default();
        for handle in handles {
            if let Handle::Binary(_) | Handle::Archive(_) = handle {
                let path = handle.require_path()?;
                plan.stage(session, component, path, Path::new(BIN_DIR), 0o755)?;
            }
        }
        Ok(plan)
    }

    /// Upload `local` and install it into `dir` under the same file name.
    pub fn stage(
        &mut self,
        session: &PlanningSession,
        component: &str,
        local: &Path,
        dir: &Path,
        mode: u32,
    ) -> Result<()> {
        let file_name = local
            .file_name()
            .with_context(|| format!("Artifact path has no file name: {}", local.display()))?
            .to_string_lossy()
            .to_string();
        let staged = ops::staging_path(component, &file_name);

        self.upload
            .get_or_insert_with(|| UploadFiles {
                control: session.control().clone(),
                files: Vec::new(),
            })
            .files
            .push(Transfer {
                local: local.to_path_buf(),
                remote: staged.clone(),
            });
        self.install
            .get_or_insert_with(|| InstallFiles { files: Vec::new() })
            .files
            .push(Install {
                source: staged,
                dest: dir.join(file_name),
                mode,
            });
        Ok(())
    }

    /// Add rendered configuration files.
    pub fn configure(&mut self, files: Vec<RenderedFile>) {
        self.configure
            .get_or_insert_with(|| RenderFiles { files: Vec::new() })
            .files
            .extend(files);
    }

    /// Finish with a service whose revision covers every staged artifact
    /// and rendered file of this plan, plus `extra` (artifact identities).
    pub fn service(&mut self, unit: &str, extra: &[String]) {
        let mut parts: Vec<String> = extra.to_vec();
        if let Some(upload) = &self.upload {
            parts.push(upload.fingerprint());
        }
        if let Some(configure) = &self.configure {
            parts.push(configure.fingerprint());
        }
        self.service = Some(EnableService {
            unit: unit.to_string(),
            revision: sha256_hex(parts.join("\n").as_bytes()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.upload.is_none()
            && self.install.is_none()
            && self.configure.is_none()
            && self.service.is_none()
    }

    /// Linear fragment for `host`, each stage depending on the previous.
    pub fn into_fragment(self, component: &str, host: &Host) -> Result<Fragment> {
        let subject = format!("{component}@{host}");
        let stages: Vec<(&str, Arc<dyn Operation>)> = [
            self.upload.map(|op| ("upload", Arc::new(op) as Arc<dyn Operation>)),
            self.install.map(|op| ("install", Arc::new(op) as Arc<dyn Operation>)),
            self.configure.map(|op| ("configure", Arc::new(op) as Arc<dyn Operation>)),
            self.service.map(|op| ("service", Arc::new(op) as Arc<dyn Operation>)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut builder = FragmentBuilder::new();
        let mut previous: Option<NodeId> = None;
        for (stage, op) in stages {
            let id = NodeId::derive(stage, &subject);
            let mut node = ExecutionNode::from_arc(format!("{stage} {subject}"), op, [host.clone()]);
            if let Some(prev) = previous.take() {
                node = node.depends_on([prev]);
            }
            builder.add(id.clone(), node)?;
            previous = Some(id);
        }
        Ok(builder.build()?)
    }
}

/// Render a configuration template, failing on any undefined variable.
pub fn render(name: &str, template: &str, context: impl Serialize) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.render_str(template, context)
        .with_context(|| format!("Failed to render {name}"))
}

/// Composes tasks against one planning session and inventory.
pub struct TaskComposer<'a> {
    session: &'a PlanningSession,
    inventory: &'a Inventory,
}

impl<'a> TaskComposer<'a> {
    pub fn new(session: &'a PlanningSession, inventory: &'a Inventory) -> Self {
        Self { session, inventory }
    }

    /// One fragment installing `task` on every host of its roles.
    pub fn compose(&self, task: &dyn ComponentTask) -> Result<Fragment> {
        let hosts = self.inventory.hosts_for_roles(task.roles());
        if hosts.is_empty() {
            log::warn!(
                "No hosts for {} (roles: {})",
                task.component(),
                task.roles().join(", ")
            );
            return Ok(Fragment::empty());
        }

        let prerequisites = task
            .prerequisites(self.session, &hosts)
            .with_context(|| format!("Failed to plan prerequisites of {}", task.component()))?;

        let mut groups = Vec::new();
        for (platform, members) in self.group_by_platform(&hosts)? {
            log::debug!(
                "Planning {} for {} host(s) on {}",
                task.component(),
                members.len(),
                platform
            );
            groups.push(self.compose_group(task, &platform, &members, &hosts, &prerequisites)?);
        }
        Ok(merge_all(groups)?)
    }

    fn compose_group(
        &self,
        task: &dyn ComponentTask,
        platform: &Platform,
        members: &[Host],
        all_hosts: &[Host],
        prerequisites: &Fragment,
    ) -> Result<Fragment> {
        let handles = task.handles(self.session, platform, members)?;

        let mut acquisition = vec![prerequisites.clone()];
        let mut independent = Vec::new();
        for handle in &handles {
            let fragment = handle
                .ensure_plan(self.session)
                .with_context(|| format!("Failed to plan {}", handle.id()))?;
            match handle.placement() {
                Placement::ControlNode => acquisition.push(fragment),
                Placement::TargetHosts(_) => independent.push(fragment),
            }
        }
        let acquisition = merge_all(acquisition)?;

        let mut chains = Vec::new();
        for host in members {
            let plan = task.host_plan(self.session, host, &handles, all_hosts)?;
            if !plan.is_empty() {
                chains.push(plan.into_fragment(task.component(), host)?);
            }
        }

        let installed = chain(acquisition, merge_all(chains)?)?;
        Ok(merge(installed, merge_all(independent)?)?)
    }

    /// Hosts keyed by the platform their artifacts are built for.
    ///
    /// A host without a pinned architecture takes the control node's, and
    /// one without a pinned OS is `linux`. The control node's OS never
    /// leaks into a target's platform.
    fn group_by_platform(&self, hosts: &[Host]) -> Result<BTreeMap<Platform, Vec<Host>>> {
        let mut groups: BTreeMap<Platform, Vec<Host>> = BTreeMap::new();
        for host in hosts {
            let arch = match &host.arch {
                Some(arch) => normalize_arch(arch)?,
                None => self.session.control_platform()?.arch,
            };
            let os = match &host.os {
                Some(os) => normalize_os(os)?,
                None => TARGET_OS.to_string(),
            };
            groups
                .entry(Platform::new(os, arch))
                .or_default()
                .push(host.clone());
        }
        Ok(groups)
    }
}

/// Every task the cluster file configures, in installation order.
pub fn cluster_tasks(config: &ClusterConfig) -> Result<Vec<Box<dyn ComponentTask>>> {
    let mut tasks: Vec<Box<dyn ComponentTask>> = Vec::new();
    if let Some(etcd) = &config.etcd {
        tasks.push(Box::new(EtcdTask::new(etcd)?));
    }
    if let Some(containerd) = &config.containerd {
        tasks.push(Box::new(ContainerdTask::new(containerd)?));
    }
    if let Some(kubernetes) = &config.kubernetes {
        tasks.push(Box::new(KubeNodeTask::new(kubernetes)));
    }
    if let Some(images) = &config.images {
        tasks.push(Box::new(ImageTask::new(images)));
    }
    Ok(tasks)
}

/// Compose every configured task and merge them.
///
/// Tasks are otherwise independent; the only cross-task edges come from
/// [`ComponentTask::runs_after`].
pub fn plan_cluster(config: &ClusterConfig, session: &PlanningSession) -> Result<Fragment> {
    let inventory = config.inventory();
    let composer = TaskComposer::new(session, &inventory);

    let mut planned = Fragment::empty();
    for task in cluster_tasks(config)? {
        let fragment = composer
            .compose(task.as_ref())
            .with_context(|| format!("Failed to plan {}", task.component()))?;
        log::debug!("{} planned {} node(s)", task.component(), fragment.len());

        let edges = service_edges(&planned, &fragment, &task.runs_after());
        planned = link(merge(planned, fragment)?, edges)
            .with_context(|| format!("Failed to order {}", task.component()))?;
    }
    Ok(planned)
}

/// `(entry node, service node)` pairs making every entry node of `fragment`
/// wait for the service of each component in `after` on its own hosts.
fn service_edges(planned: &Fragment, fragment: &Fragment, after: &[String]) -> Vec<(NodeId, NodeId)> {
    let mut edges = Vec::new();
    for id in fragment.entry_nodes() {
        let Some(node) = fragment.get(id) else {
            continue;
        };
        for host in node.hosts() {
            for component in after {
                let service = NodeId::derive("service", format!("{component}@{host}"));
                if planned.contains(&service) {
                    edges.push((id.clone(), service));
                }
            }
        }
    }
    edges
}
