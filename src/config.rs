//! Cluster file loading
//!
//! A cluster file is TOML:
//!
//! ```toml
//! [cluster]
//! name = "demo"
//! work_dir = "~/.local/share/clusterforge"   # optional
//! mirror = "https://mirror.internal/releases" # optional
//!
//! [control]                                   # optional, defaults to localhost
//! name = "control"
//! address = "localhost"
//!
//! [[hosts]]
//! name = "node1"
//! address = "10.0.0.11"
//! user = "root"
//! roles = ["etcd", "control-plane"]
//! arch = "arm64"                              # optional, defaults to the control node's
//! os = "linux"                                # optional, defaults to linux
//!
//! [etcd]
//! version = "3.5.9"
//! checksum = "sha256:..."                     # optional
//!
//! [components.etcd]                           # optional registry override
//! kind = "archive"
//! base_url = "https://mirror.internal/etcd"
//! url = "{{ base }}/etcd-{{ version }}.tgz"
//! file = "etcd-{{ version }}.tgz"
//! binaries = { etcd = "etcd", etcdctl = "etcdctl" }
//! ```

use crate::inventory::Inventory;
use anyhow::{Context, Result};
use artifacts::{Checksum, ComponentRegistry, ComponentSpec, ImageRuntime};
use execgraph::Host;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Problems a cluster file can have beyond its syntax.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("host '{0}' is defined more than once")]
    DuplicateHost(String),

    #[error("host '{0}' has no address")]
    MissingAddress(String),

    #[error("[{component}] needs a version")]
    MissingVersion { component: &'static str },

    #[error("[{component}] has an invalid checksum: {message}")]
    InvalidChecksum {
        component: &'static str,
        message: String,
    },
}

/// The whole cluster file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,

    /// Host artifacts are acquired on.
    #[serde(default)]
    pub control: Option<Host>,

    #[serde(default)]
    pub hosts: Vec<Host>,

    #[serde(default)]
    pub etcd: Option<EtcdConfig>,

    #[serde(default)]
    pub containerd: Option<ContainerdConfig>,

    #[serde(default)]
    pub kubernetes: Option<KubernetesConfig>,

    #[serde(default)]
    pub images: Option<ImagesConfig>,

    /// Registry entries added to, or replacing, the built-in ones.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub mirror: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub version: String,
    #[serde(default = "default_etcd_roles")]
    pub roles: Vec<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default = "default_etcd_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerdConfig {
    pub version: String,
    pub runc_version: String,
    #[serde(default = "default_node_roles")]
    pub roles: Vec<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    pub version: String,
    #[serde(default = "default_node_roles")]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_sandbox_image")]
    pub pause: String,
    #[serde(default)]
    pub extra: Vec<String>,
    #[serde(default)]
    pub runtime: ImageRuntime,
    #[serde(default = "default_node_roles")]
    pub roles: Vec<String>,
}

fn default_etcd_roles() -> Vec<String> {
    vec!["etcd".to_string()]
}

fn default_node_roles() -> Vec<String> {
    vec!["control-plane".to_string(), "worker".to_string()]
}

fn default_etcd_data_dir() -> String {
    "/var/lib/etcd".to_string()
}

const fn default_client_port() -> u16 {
    2379
}

const fn default_peer_port() -> u16 {
    2380
}

fn default_sandbox_image() -> String {
    "registry.k8s.io/pause:3.9".to_string()
}

impl ClusterConfig {
    /// Load and validate a cluster file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid cluster file {}", path.display()))
    }

    /// Parse and validate cluster file content.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check what the schema alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::EmptyClusterName);
        }

        let mut seen = BTreeSet::new();
        for host in &self.hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
            if host.address.trim().is_empty() {
                return Err(ConfigError::MissingAddress(host.name.clone()));
            }
        }

        if let Some(etcd) = &self.etcd {
            require_version("etcd", &etcd.version)?;
            parse_checksum("etcd", etcd.checksum.as_deref())?;
        }
        if let Some(containerd) = &self.containerd {
            require_version("containerd", &containerd.version)?;
            require_version("containerd", &containerd.runc_version)?;
            parse_checksum("containerd", containerd.checksum.as_deref())?;
        }
        if let Some(kubernetes) = &self.kubernetes {
            require_version("kubernetes", &kubernetes.version)?;
        }
        Ok(())
    }

    /// The control node, localhost unless configured.
    pub fn control_host(&self) -> Host {
        self.control
            .clone()
            .unwrap_or_else(|| Host::local("control"))
    }

    pub fn inventory(&self) -> Inventory {
        Inventory::new(self.hosts.clone())
    }

    /// Built-in registry with this file's overrides applied.
    pub fn registry(&self) -> ComponentRegistry {
        let mut registry = ComponentRegistry::builtin();
        for (name, spec) in &self.components {
            log::debug!("Registry override for {}", name);
            registry.register(name.clone(), spec.clone());
        }
        registry
    }
}

fn require_version(component: &'static str, version: &str) -> Result<(), ConfigError> {
    if version.trim().is_empty() {
        return Err(ConfigError::MissingVersion { component });
    }
    Ok(())
}

/// Parse an optional checksum from the cluster file.
pub fn parse_checksum(
    component: &'static str,
    value: Option<&str>,
) -> Result<Option<Checksum>, ConfigError> {
    value
        .map(|raw| {
            Checksum::parse(raw).map_err(|e| ConfigError::InvalidChecksum {
                component,
                message: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifacts::SourceKind;

    const SAMPLE: &str = r#"
[cluster]
name = "demo"
mirror = "https://mirror.internal"

[[hosts]]
name = "node1"
address = "10.0.0.11"
user = "root"
roles = ["etcd", "control-plane"]

[[hosts]]
name = "node2"
address = "10.0.0.12"
roles = ["etcd", "worker"]
arch = "arm64"

[etcd]
version = "3.5.9"

[containerd]
version = "1.7.20"
runc_version = "1.1.12"

[images]
runtime = "docker"

[components.tool]
kind = "archive"
base_url = "http://fixtures"
url = "{{ base }}/tool-{{ version }}.tgz"
file = "tool-{{ version }}.tgz"
binaries = { tool = "bin/tool" }
"#;

    #[test]
    fn test_parse_sample() {
        let config = ClusterConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.cluster.name, "demo");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].arch.as_deref(), Some("arm64"));

        let etcd = config.etcd.as_ref().unwrap();
        assert_eq!(etcd.roles, vec!["etcd"]);
        assert_eq!(etcd.data_dir, "/var/lib/etcd");
        assert_eq!(etcd.client_port, 2379);

        let images = config.images.as_ref().unwrap();
        assert_eq!(images.runtime, ImageRuntime::Docker);
        assert_eq!(images.pause, "registry.k8s.io/pause:3.9");
        assert!(config.kubernetes.is_none());
    }

    #[test]
    fn test_control_defaults_to_localhost() {
        let config = ClusterConfig::parse(SAMPLE).unwrap();
        let control = config.control_host();
        assert_eq!(control.name, "control");
        assert!(control.is_local());
    }

    #[test]
    fn test_registry_overrides() {
        let config = ClusterConfig::parse(SAMPLE).unwrap();
        let registry = config.registry();
        assert!(registry.contains("etcd"));
        let tool = registry.get("tool").unwrap();
        assert_eq!(
            tool.source,
            SourceKind::Archive {
                binaries: BTreeMap::from([("tool".to_string(), "bin/tool".to_string())]),
            }
        );
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let content = r#"
[cluster]
name = "demo"

[[hosts]]
name = "node1"
address = "10.0.0.11"

[[hosts]]
name = "node1"
address = "10.0.0.12"
"#;
        let err = ClusterConfig::parse(content).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_version_rejected() {
        let content = r#"
[cluster]
name = "demo"

[etcd]
version = ""
"#;
        let err = ClusterConfig::parse(content).unwrap_err();
        assert!(err.to_string().contains("[etcd] needs a version"));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let content = r#"
[cluster]
name = "demo"

[etcd]
version = "3.5.9"
checksum = "md5:abc"
"#;
        let err = ClusterConfig::parse(content).unwrap_err();
        assert!(err.to_string().contains("invalid checksum"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        fs::write(&path, SAMPLE).unwrap();
        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.cluster.mirror.as_deref(), Some("https://mirror.internal"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClusterConfig::load(Path::new("/nonexistent/cluster.toml")).unwrap_err();
        assert!(err.to_string().contains("Could not read"));
    }
}
