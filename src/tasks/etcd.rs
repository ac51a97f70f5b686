//! etcd: release archive binaries, TLS material and a systemd unit per member.

use super::ops::RenderedFile;
use super::pki::Pki;
use super::{ComponentTask, HostPlan, UNIT_DIR, render};
use crate::config::{EtcdConfig, parse_checksum};
use anyhow::{Context, Result};
use artifacts::{
    ArtifactRequest, Checksum, Handle, LocalCertificate, Platform, PlanningSession, ResourceHandle,
};
use execgraph::{Fragment, Host};
use serde_json::json;
use std::path::Path;

const COMPONENT: &str = "etcd";
const BINARIES: [&str; 2] = ["etcd", "etcdctl"];
const PKI_DIR: &str = "/etc/etcd/pki";
const ENV_FILE: &str = "/etc/etcd/etcd.env";

const ENV_TEMPLATE: &str = "\
ETCD_NAME={{ host.name }}
ETCD_DATA_DIR={{ data_dir }}
ETCD_LISTEN_CLIENT_URLS=https://{{ host.address }}:{{ client_port }},https://127.0.0.1:{{ client_port }}
ETCD_ADVERTISE_CLIENT_URLS=https://{{ host.address }}:{{ client_port }}
ETCD_LISTEN_PEER_URLS=https://{{ host.address }}:{{ peer_port }}
ETCD_INITIAL_ADVERTISE_PEER_URLS=https://{{ host.address }}:{{ peer_port }}
ETCD_INITIAL_CLUSTER={% for m in members %}{{ m.name }}=https://{{ m.address }}:{{ peer_port }}{% if not loop.last %},{% endif %}{% endfor %}
ETCD_INITIAL_CLUSTER_STATE=new
ETCD_INITIAL_CLUSTER_TOKEN={{ cluster }}
ETCD_TRUSTED_CA_FILE={{ pki }}/ca.pem
ETCD_CERT_FILE={{ pki }}/{{ cert }}
ETCD_KEY_FILE={{ pki }}/{{ key }}
ETCD_CLIENT_CERT_AUTH=true
ETCD_PEER_TRUSTED_CA_FILE={{ pki }}/ca.pem
ETCD_PEER_CERT_FILE={{ pki }}/{{ cert }}
ETCD_PEER_KEY_FILE={{ pki }}/{{ key }}
ETCD_PEER_CLIENT_CERT_AUTH=true
";

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=etcd key-value store
Documentation=https://etcd.io/docs
After=network-online.target
Wants=network-online.target

[Service]
Type=notify
EnvironmentFile={{ env_file }}
ExecStart=/usr/local/bin/etcd
Restart=on-failure
RestartSec=5
LimitNOFILE=65536

[Install]
WantedBy=multi-user.target
";

/// etcd on every host of its roles.
#[derive(Debug, Clone)]
pub struct EtcdTask {
    config: EtcdConfig,
    checksum: Option<Checksum>,
}

impl EtcdTask {
    pub fn new(config: &EtcdConfig) -> Result<Self> {
        let checksum = parse_checksum(COMPONENT, config.checksum.as_deref())?;
        Ok(Self {
            config: config.clone(),
            checksum,
        })
    }
}

impl ComponentTask for EtcdTask {
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
        hosts: &[Host],
    ) -> Result<Vec<Handle>> {
        let mut handles = Vec::new();
        for binary in BINARIES {
            let request = ArtifactRequest::new(COMPONENT, &self.config.version)
                .platform(platform)
                .binary(binary)
                .checksum(self.checksum.clone());
            handles.push(Handle::remote(session, &request)?);
        }

        let pki = Pki::new(session, COMPONENT);
        handles.push(Handle::Certificate(pki.ca().clone()));
        for host in hosts {
            handles.push(Handle::Certificate(pki.member(session, host)));
        }
        Ok(handles)
    }

    fn prerequisites(&self, session: &PlanningSession, hosts: &[Host]) -> Result<Fragment> {
        Pki::new(session, COMPONENT).plan(session, hosts)
    }

    fn host_plan(
        &self,
        session: &PlanningSession,
        host: &Host,
        handles: &[Handle],
        members: &[Host],
    ) -> Result<HostPlan> {
        let mut plan = HostPlan::binaries(session, COMPONENT, handles)?;

        let ca = certificate(handles, "ca")?;
        let member = certificate(handles, &format!("member-{}", host.name))?;
        let pki = Path::new(PKI_DIR);
        plan.stage(session, COMPONENT, ca.cert_path(), pki, 0o644)?;
        plan.stage(session, COMPONENT, member.cert_path(), pki, 0o644)?;
        plan.stage(session, COMPONENT, member.key_path(), pki, 0o600)?;

        let env = render(
            ENV_FILE,
            ENV_TEMPLATE,
            json!({
                "host": host,
                "members": members,
                "cluster": session.cluster(),
                "data_dir": self.config.data_dir,
                "client_port": self.config.client_port,
                "peer_port": self.config.peer_port,
                "pki": PKI_DIR,
                "cert": file_name(member.cert_path()),
                "key": file_name(member.key_path()),
            }),
        )?;
        let unit = render("etcd.service", UNIT_TEMPLATE, json!({ "env_file": ENV_FILE }))?;
        plan.configure(vec![
            RenderedFile::new(ENV_FILE, env),
            RenderedFile::new(format!("{UNIT_DIR}/etcd.service"), unit),
        ]);

        let identities: Vec<String> = handles.iter().map(ResourceHandle::id).collect();
        plan.service(COMPONENT, &identities);
        Ok(plan)
    }
}

fn certificate<'h>(handles: &'h [Handle], name: &str) -> Result<&'h LocalCertificate> {
    handles
        .iter()
        .find_map(|handle| match handle {
            Handle::Certificate(cert) if cert.name() == name => Some(cert),
            _ => None,
        })
        .with_context(|| format!("No {name} certificate planned for {COMPONENT}"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
