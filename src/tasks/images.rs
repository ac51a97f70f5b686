//! Container images pulled on every node by its runtime.

use super::{ComponentTask, HostPlan};
use crate::config::ImagesConfig;
use anyhow::Result;
use artifacts::{Handle, ImageRuntime, Platform, PlanningSession};
use execgraph::Host;

/// The pause image plus any extra images.
#[derive(Debug, Clone)]
pub struct ImageTask {
    references: Vec<String>,
    runtime: ImageRuntime,
    roles: Vec<String>,
}

impl ImageTask {
    pub fn new(config: &ImagesConfig) -> Self {
        let mut references = vec![config.pause.clone()];
        for image in &config.extra {
            if !references.contains(image) {
                references.push(image.clone());
            }
        }
        Self {
            references,
            runtime: config.runtime,
            roles: config.roles.clone(),
        }
    }
}

impl ComponentTask for ImageTask {
    fn component(&self) -> &str {
        "images"
    }

    fn roles(&self) -> &[String] {
        &self.roles
    }

    fn handles(
        &self,
        _session: &PlanningSession,
        _platform: &Platform,
        hosts: &[Host],
    ) -> Result<Vec<Handle>> {
        Ok(self
            .references
            .iter()
            .map(|reference| Handle::image(reference.clone(), self.runtime, hosts.to_vec()))
            .collect())
    }

    // `ctr` ships with containerd, so a host pulls once its runtime is up.
    // Docker is not installed by any task and gets no ordering.
    fn runs_after(&self) -> Vec<String> {
        match self.runtime {
            ImageRuntime::Containerd => vec!["containerd".to_string()],
            ImageRuntime::Docker => Vec::new(),
        }
    }

    // Pulls are the whole job; nothing follows them on the host.
    fn host_plan(
        &self,
        _session: &PlanningSession,
        _host: &Host,
        _handles: &[Handle],
        _members: &[Host],
    ) -> Result<HostPlan> {
        Ok(HostPlan::default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::TaskComposer;
    use super::super::testutil::{hosts, session};
    use super::*;
    use crate::inventory::Inventory;
    use execgraph::testing::MockConnector;
    use std::sync::Arc;

    fn config(extra: &str) -> ImagesConfig {
        toml::from_str(&format!("extra = [{extra}]")).unwrap()
    }

    #[test]
    fn test_pulls_are_independent() {
        let mock = Arc::new(MockConnector::new());
        let s = session(&mock);
        let inventory = Inventory::new(hosts(3, "worker"));
        let task = ImageTask::new(&config("\"registry.k8s.io/coredns/coredns:v1.11.1\""));
        let fragment = TaskComposer::new(&s, &inventory).compose(&task).unwrap();

        assert_eq!(fragment.len(), 6);
        assert_eq!(fragment.entry_nodes(), fragment.exit_nodes());
        assert!(fragment.nodes().all(|(_, node)| node.dependencies().is_empty()));
    }

    #[test]
    fn test_duplicate_extra_image_pulled_once() {
        let task = ImageTask::new(&config("\"registry.k8s.io/pause:3.9\""));
        assert_eq!(task.references, vec!["registry.k8s.io/pause:3.9"]);
        assert_eq!(task.runtime, ImageRuntime::Containerd);
    }

    #[test]
    fn test_pulls_wait_for_containerd_runtime() {
        assert_eq!(ImageTask::new(&config("")).runs_after(), vec!["containerd"]);

        let docker: ImagesConfig = toml::from_str("runtime = \"docker\"").unwrap();
        assert!(ImageTask::new(&docker).runs_after().is_empty());
    }

    #[test]
    fn test_no_nodes_no_pulls() {
        let mock = Arc::new(MockConnector::new());
        let s = session(&mock);
        let inventory = Inventory::new(hosts(2, "etcd"));
        let task = ImageTask::new(&config(""));
        let fragment = TaskComposer::new(&s, &inventory).compose(&task).unwrap();
        assert!(fragment.is_empty());
    }
}
