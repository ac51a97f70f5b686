//! Kubernetes node binaries and the kubelet unit.

use super::ops::RenderedFile;
use super::{ComponentTask, HostPlan, UNIT_DIR, render};
use crate::config::KubernetesConfig;
use anyhow::Result;
use artifacts::{ArtifactRequest, Handle, Platform, PlanningSession, ResourceHandle};
use execgraph::Host;
use serde_json::json;

const COMPONENT: &str = "kubernetes";
const BINARIES: [&str; 3] = ["kubelet", "kubeadm", "kubectl"];
const DEFAULTS_FILE: &str = "/etc/default/kubelet";

const DEFAULTS_TEMPLATE: &str = "\
KUBELET_EXTRA_ARGS=--node-ip={{ host.address }} --hostname-override={{ host.name }}
";

// kubeadm writes the kubelet configuration and bootstrap kubeconfig that
// the drop-in arguments below point to.
const UNIT_TEMPLATE: &str = "\
[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
Wants=network-online.target containerd.service
After=network-online.target containerd.service

[Service]
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
EnvironmentFile=-{{ defaults_file }}
ExecStart=/usr/local/bin/kubelet \\
  --bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf \\
  --kubeconfig=/etc/kubernetes/kubelet.conf \\
  --config=/var/lib/kubelet/config.yaml \\
  $KUBELET_KUBEADM_ARGS $KUBELET_EXTRA_ARGS
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

/// kubelet, kubeadm and kubectl on every node.
#[derive(Debug, Clone)]
pub struct KubeNodeTask {
    config: KubernetesConfig,
}

impl KubeNodeTask {
    pub fn new(config: &KubernetesConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl ComponentTask for KubeNodeTask {
    fn component(&self) -> &str {
        COMPONENT
    }

    fn roles(&self) -> &[String] {
        &self.config.roles
    }

    fn handles(
        &self,
        session: &PlanningSession,
        platform: &Platform,
        _hosts: &[Host],
    ) -> Result<Vec<Handle>> {
        BINARIES
            .iter()
            .map(|binary| {
                let request = ArtifactRequest::new(*binary, &self.config.version).platform(platform);
                Ok(Handle::remote(session, &request)?)
            })
            .collect()
    }

    fn host_plan(
        &self,
        session: &PlanningSession,
        host: &Host,
        handles: &[Handle],
        _members: &[Host],
    ) -> Result<HostPlan> {
        let mut plan = HostPlan::binaries(session, COMPONENT, handles)?;

        let defaults = render(DEFAULTS_FILE, DEFAULTS_TEMPLATE, json!({ "host": host }))?;
        let unit = render(
            "kubelet.service",
            UNIT_TEMPLATE,
            json!({ "defaults_file": DEFAULTS_FILE }),
        )?;
        plan.configure(vec![
            RenderedFile::new(DEFAULTS_FILE, defaults),
            RenderedFile::new(format!("{UNIT_DIR}/kubelet.service"), unit),
        ]);

        let identities: Vec<String> = handles.iter().map(ResourceHandle::id).collect();
        plan.service("kubelet", &identities);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::super::TaskComposer;
    use super::super::testutil::{hosts, linux_amd64, session};
    use super::*;
    use crate::inventory::Inventory;
    use execgraph::testing::MockConnector;
    use execgraph::{CancelToken, ExecuteOptions, NoProgress, execute};
    use std::sync::Arc;

    fn task() -> KubeNodeTask {
        let config: KubernetesConfig = toml::from_str("version = \"1.30.2\"").unwrap();
        KubeNodeTask::new(&config)
    }

    fn serve_binaries(mock: &MockConnector, arch: &str) {
        for binary in BINARIES {
            mock.serve(
                format!("https://dl.k8s.io/release/v1.30.2/bin/linux/{arch}/{binary}"),
                binary.as_bytes().to_vec(),
            );
        }
    }

    #[test]
    fn test_default_roles_cover_every_node() {
        let task = task();
        assert_eq!(task.roles(), &["control-plane".to_string(), "worker".to_string()]);

        let mock = Arc::new(MockConnector::new());
        let s = session(&mock);
        let mut fleet = hosts(1, "control-plane");
        fleet.extend(hosts(3, "worker").into_iter().skip(1));
        let inventory = Inventory::new(fleet);
        let fragment = TaskComposer::new(&s, &inventory).compose(&task).unwrap();

        // 3 binaries x (download, chmod) + 3 hosts x 4 steps
        assert_eq!(fragment.len(), 6 + 3 * 4);
        assert_eq!(fragment.exit_nodes().len(), 3);
    }

    #[test]
    fn test_apply_installs_kubelet() {
        let mock = Arc::new(MockConnector::new());
        serve_binaries(&mock, "amd64");
        let s = session(&mock);
        let inventory = Inventory::new(hosts(1, "worker"));
        let fragment = TaskComposer::new(&s, &inventory).compose(&task()).unwrap();

        let report = execute(
            &fragment,
            mock.as_ref(),
            &ExecuteOptions::default(),
            &CancelToken::new(),
            &mut NoProgress,
        )
        .unwrap();
        assert!(report.is_success());

        let node = Host::new("node1", "10.0.0.11");
        for binary in BINARIES {
            assert_eq!(mock.mode(&node, format!("/usr/local/bin/{binary}")), Some(0o755));
        }
        assert_eq!(
            mock.file(&node, DEFAULTS_FILE),
            Some(b"KUBELET_EXTRA_ARGS=--node-ip=10.0.0.11 --hostname-override=node1\n".to_vec())
        );
        let state = mock.service_state(&node, "kubelet");
        assert!(state.enabled && state.active);
    }

    #[test]
    fn test_unit_keeps_line_continuations() {
        let mock = Arc::new(MockConnector::new());
        let s = session(&mock);
        let node = Host::new("node1", "10.0.0.11");
        let task = task();
        let handles = task.handles(&s, &linux_amd64(), &[node.clone()]).unwrap();
        let plan = task.host_plan(&s, &node, &handles, &[node.clone()]).unwrap();

        let configure = plan.configure.unwrap();
        let unit = &configure.files[1];
        assert!(unit.content.contains("ExecStart=/usr/local/bin/kubelet \\\n"));
        assert!(unit.content.contains("EnvironmentFile=-/etc/default/kubelet\n"));
    }
}
