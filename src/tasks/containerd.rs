//! containerd with runc, its CRI configuration and unit.

use super::ops::RenderedFile;
use super::{BIN_DIR, ComponentTask, HostPlan, UNIT_DIR, render};
use crate::config::{ContainerdConfig, parse_checksum};
use anyhow::Result;
use artifacts::{ArtifactRequest, Checksum, Handle, Platform, PlanningSession, ResourceHandle};
use execgraph::Host;
use serde_json::json;
use std::path::Path;

const COMPONENT: &str = "containerd";
const BINARIES: [&str; 3] = ["containerd", "containerd-shim-runc-v2", "ctr"];
const SBIN_DIR: &str = "/usr/local/sbin";
const CONFIG_FILE: &str = "/etc/containerd/config.toml";

const CONFIG_TEMPLATE: &str = r#"version = 2

[plugins."io.containerd.grpc.v1.cri"]
  sandbox_image = "{{ sandbox_image }}"

[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc]
  runtime_type = "io.containerd.runc.v2"

[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc.options]
  BinaryName = "{{ runc }}"
  SystemdCgroup = true
"#;

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=containerd container runtime
Documentation=https://containerd.io
After=network.target local-fs.target

[Service]
ExecStartPre=-/sbin/modprobe overlay
ExecStart={{ bin_dir }}/containerd --config {{ config_file }}
Type=notify
Delegate=yes
KillMode=process
Restart=always
RestartSec=5
LimitNPROC=infinity
LimitCORE=infinity
LimitNOFILE=infinity
TasksMax=infinity
OOMScoreAdjust=-999

[Install]
WantedBy=multi-user.target
";

/// containerd and runc on every node.
#[derive(Debug, Clone)]
pub struct ContainerdTask {
    config: ContainerdConfig,
    checksum: Option<Checksum>,
}

impl ContainerdTask {
    pub fn new(config: &ContainerdConfig) -> Result<Self> {
        let checksum = parse_checksum(COMPONENT, config.checksum.as_deref())?;
        Ok(Self {
            config: config.clone(),
            checksum,
        })
    }
}

impl ComponentTask for ContainerdTask {
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
        let mut handles = Vec::new();
        for binary in BINARIES {
            let request = ArtifactRequest::new(COMPONENT, &self.config.version)
                .platform(platform)
                .binary(binary)
                .checksum(self.checksum.clone());
            handles.push(Handle::remote(session, &request)?);
        }
        handles.push(Handle::remote(
            session,
            &ArtifactRequest::new("runc", &self.config.runc_version).platform(platform),
        )?);
        Ok(handles)
    }

    fn host_plan(
        &self,
        session: &PlanningSession,
        _host: &Host,
        handles: &[Handle],
        _members: &[Host],
    ) -> Result<HostPlan> {
        let mut plan = HostPlan::default();
        for handle in handles {
            let dir = match handle {
                Handle::Binary(_) => SBIN_DIR,
                _ => BIN_DIR,
            };
            plan.stage(session, COMPONENT, handle.require_path()?, Path::new(dir), 0o755)?;
        }

        let config = render(
            CONFIG_FILE,
            CONFIG_TEMPLATE,
            json!({
                "sandbox_image": self.config.sandbox_image,
                "runc": format!("{SBIN_DIR}/runc"),
            }),
        )?;
        let unit = render(
            "containerd.service",
            UNIT_TEMPLATE,
            json!({ "bin_dir": BIN_DIR, "config_file": CONFIG_FILE }),
        )?;
        plan.configure(vec![
            RenderedFile::new(CONFIG_FILE, config),
            RenderedFile::new(format!("{UNIT_DIR}/containerd.service"), unit),
        ]);

        let identities: Vec<String> = handles.iter().map(ResourceHandle::id).collect();
        plan.service(COMPONENT, &identities);
        Ok(plan)
    }
}
