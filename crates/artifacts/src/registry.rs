//! Component download registry.
//!
//! A [`ComponentRegistry`] is a plain lookup table from component name to
//! [`ComponentSpec`]. Nothing reads it implicitly: a registry is handed to
//! each [`PlanningSession`](crate::PlanningSession), so tests and cluster
//! files can substitute or extend entries freely.
//!
//! Locations are minijinja templates rendered with four variables:
//!
//! | Variable  | Example                                             |
//! |-----------|-----------------------------------------------------|
//! | `base`    | `https://github.com/etcd-io/etcd/releases/download` |
//! | `version` | `3.5.9`                                             |
//! | `arch`    | `amd64`                                             |
//! | `os`      | `linux`                                             |
//!
//! `base` is the component's `base_url`, or the session mirror when one is set.

use crate::error::{Error, Result};
use crate::platform::Platform;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a component is distributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    /// The download is the executable itself.
    Binary,
    /// The download is an archive; `binaries` maps a binary key to its
    /// archive-relative path template.
    Archive {
        #[serde(default)]
        binaries: BTreeMap<String, String>,
    },
}

/// Download templates for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Default value of `base`
    pub base_url: String,
    /// Download URL template
    pub url: String,
    /// Local file name template inside the artifact directory
    pub file: String,
    #[serde(flatten)]
    pub source: SourceKind,
}

impl ComponentSpec {
    /// A component downloaded as a bare executable.
    pub fn binary(base_url: &str, url: &str, file: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            url: url.to_string(),
            file: file.to_string(),
            source: SourceKind::Binary,
        }
    }

    /// A component shipped in an archive.
    pub fn archive<'a, I>(base_url: &str, url: &str, file: &str, binaries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            base_url: base_url.to_string(),
            url: url.to_string(),
            file: file.to_string(),
            source: SourceKind::Archive {
                binaries: binaries
                    .into_iter()
                    .map(|(key, path)| (key.to_string(), path.to_string()))
                    .collect(),
            },
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.source, SourceKind::Archive { .. })
    }
}

/// A component spec with every template rendered for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponent {
    pub url: String,
    pub file: String,
    /// Rendered archive-relative paths, `None` for direct binaries
    pub binaries: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct TemplateVars<'a> {
    base: &'a str,
    version: &'a str,
    arch: &'a str,
    os: &'a str,
}

/// Injectable table of known components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRegistry {
    components: BTreeMap<String, ComponentSpec>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a component.
    pub fn register(&mut self, name: impl Into<String>, spec: ComponentSpec) -> &mut Self {
        self.components.insert(name.into(), spec);
        self
    }

    /// Add every entry of `other`, replacing existing names.
    pub fn extend(&mut self, other: ComponentRegistry) {
        self.components.extend(other.components);
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Registered component names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Render every template of `component` for `version` on `platform`.
    pub fn resolve(
        &self,
        component: &str,
        version: &str,
        platform: &Platform,
        mirror: Option<&str>,
    ) -> Result<ResolvedComponent> {
        let spec = self
            .get(component)
            .ok_or_else(|| Error::UnknownComponent(component.to_string()))?;

        let vars = TemplateVars {
            base: mirror
                .map(|m| m.trim_end_matches('/'))
                .unwrap_or(spec.base_url.as_str()),
            version,
            arch: &platform.arch,
            os: &platform.os,
        };
        let env = template_env();
        let ctx = Value::from_serialize(&vars);
        let render = |field: &str, template: &str| {
            env.render_str(template, ctx.clone())
                .map_err(|e| Error::Template {
                    component: component.to_string(),
                    field: field.to_string(),
                    message: e.to_string(),
                })
        };

        let url = render("url", &spec.url)?;
        let file = render("file", &spec.file)?;
        let binaries = match &spec.source {
            SourceKind::Binary => None,
            SourceKind::Archive { binaries } => Some(
                binaries
                    .iter()
                    .map(|(key, path)| Ok((key.clone(), render(key, path)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
        };

        log::debug!("Resolved {}@{} for {}: {}", component, version, platform, url);
        Ok(ResolvedComponent {
            url,
            file,
            binaries,
        })
    }

    /// Components the built-in tasks install.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(
                "etcd",
                ComponentSpec::archive(
                    "https://github.com/etcd-io/etcd/releases/download",
                    "{{ base }}/v{{ version }}/etcd-v{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    "etcd-{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    [
                        ("etcd", "etcd-v{{ version }}-{{ os }}-{{ arch }}/etcd"),
                        ("etcdctl", "etcd-v{{ version }}-{{ os }}-{{ arch }}/etcdctl"),
                        ("etcdutl", "etcd-v{{ version }}-{{ os }}-{{ arch }}/etcdutl"),
                    ],
                ),
            )
            .register(
                "containerd",
                ComponentSpec::archive(
                    "https://github.com/containerd/containerd/releases/download",
                    "{{ base }}/v{{ version }}/containerd-{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    "containerd-{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    [
                        ("containerd", "bin/containerd"),
                        ("containerd-shim-runc-v2", "bin/containerd-shim-runc-v2"),
                        ("ctr", "bin/ctr"),
                    ],
                ),
            )
            .register(
                "runc",
                ComponentSpec::binary(
                    "https://github.com/opencontainers/runc/releases/download",
                    "{{ base }}/v{{ version }}/runc.{{ arch }}",
                    "runc",
                ),
            )
            .register(
                "crictl",
                ComponentSpec::archive(
                    "https://github.com/kubernetes-sigs/cri-tools/releases/download",
                    "{{ base }}/v{{ version }}/crictl-v{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    "crictl-{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    [("crictl", "crictl")],
                ),
            )
            .register(
                "cni-plugins",
                ComponentSpec::archive(
                    "https://github.com/containernetworking/plugins/releases/download",
                    "{{ base }}/v{{ version }}/cni-plugins-{{ os }}-{{ arch }}-v{{ version }}.tgz",
                    "cni-plugins-{{ os }}-{{ arch }}-{{ version }}.tgz",
                    [
                        ("bridge", "bridge"),
                        ("host-local", "host-local"),
                        ("loopback", "loopback"),
                        ("portmap", "portmap"),
                    ],
                ),
            )
            .register(
                "helm",
                ComponentSpec::archive(
                    "https://get.helm.sh",
                    "{{ base }}/helm-v{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    "helm-{{ version }}-{{ os }}-{{ arch }}.tar.gz",
                    [("helm", "{{ os }}-{{ arch }}/helm")],
                ),
            );

        for binary in ["kubelet", "kubeadm", "kubectl"] {
            registry.register(
                binary,
                ComponentSpec::binary(
                    "https://dl.k8s.io/release",
                    &format!("{{{{ base }}}}/v{{{{ version }}}}/bin/{{{{ os }}}}/{{{{ arch }}}}/{binary}"),
                    binary,
                ),
            );
        }
        registry
    }
}

fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}
