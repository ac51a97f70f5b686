//! Resource handles
//!
//! A handle is a planner for one logical artifact. It exposes a stable
//! identity, a deterministic path and `ensure_plan`, which returns the
//! control-node fragment that makes the artifact available, or the empty
//! fragment when it already is.
//!
//! The set of handle kinds is closed ([`Handle`]); each variant owns its
//! planning algorithm:
//!
//! - [`RemoteBinary`]: download straight to the final path, then chmod
//! - [`RemoteArchive`]: download, extract, then finalize one binary
//! - [`LocalCertificate`]: never plans anything, only reports presence
//! - [`RemoteImage`]: one independent pull per target host
//!
//! # Example
//!
//! ```ignore
//! let session = PlanningSession::new("/var/lib/clusterforge", "demo", control, connector);
//! let handle = Handle::remote(
//!     &session,
//!     &ArtifactRequest::new("etcd", "3.5.9").arch("amd64").binary("etcd"),
//! )?;
//! assert!(handle.path().unwrap().ends_with("extracted_etcd-3.5.9-linux-amd64/etcd"));
//! let fragment = handle.ensure_plan(&session)?;
//! ```

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::identity::{ResourceIdentity, extraction_dir};
use crate::ops::{DownloadFile, ExtractArchive, FinalizeBinary, ImageRuntime, MarkExecutable, PullImage};
use crate::platform::{Platform, normalize_arch, normalize_os};
use crate::session::PlanningSession;
use execgraph::{ExecutionNode, Fragment, FragmentBuilder, Host, NodeId};
use std::path::{Path, PathBuf};

/// Where a handle's plan runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Acquisition on the control node, distributed afterwards.
    ControlNode,
    /// Directly on each of these hosts.
    TargetHosts(Vec<Host>),
}

/// Capability shared by every handle kind.
pub trait ResourceHandle {
    /// Stable textual identity.
    fn id(&self) -> String;

    /// Resolved artifact path on the control node, if the artifact is a file.
    fn path(&self) -> Option<&Path>;

    /// Where the plan's nodes run.
    fn placement(&self) -> Placement;

    /// Fragment that makes the artifact available.
    fn ensure_plan(&self, session: &PlanningSession) -> Result<Fragment>;
}

/// Parameters of a registry-backed artifact request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub component: String,
    pub version: String,
    pub arch: Option<String>,
    pub os: Option<String>,
    pub binary: Option<String>,
    pub checksum: Option<Checksum>,
}

impl ArtifactRequest {
    pub fn new(component: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            version: version.into(),
            arch: None,
            os: None,
            binary: None,
            checksum: None,
        }
    }

    #[must_use]
    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    #[must_use]
    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    /// Pin both OS and architecture.
    #[must_use]
    pub fn platform(self, platform: &Platform) -> Self {
        self.os(&platform.os).arch(&platform.arch)
    }

    /// Request one binary out of an archive.
    #[must_use]
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    #[must_use]
    pub fn checksum(mut self, checksum: Option<Checksum>) -> Self {
        self.checksum = checksum;
        self
    }
}

// =============================================================================
// Remote binary
// =============================================================================

/// An executable downloaded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBinary {
    identity: ResourceIdentity,
    url: String,
    path: PathBuf,
    checksum: Option<Checksum>,
}

impl RemoteBinary {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn download(&self) -> DownloadFile {
        DownloadFile {
            url: self.url.clone(),
            dest: self.path.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

impl ResourceHandle for RemoteBinary {
    fn id(&self) -> String {
        self.identity.to_string()
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn placement(&self) -> Placement {
        Placement::ControlNode
    }

    fn ensure_plan(&self, session: &PlanningSession) -> Result<Fragment> {
        let control = session.control();
        let download = self.download();
        if download
            .verified(&session.exec_context(), control)
            .map_err(|e| Error::precheck(control, &e))?
        {
            log::debug!("{} already present at {}", self.identity, self.path.display());
            return Ok(Fragment::empty());
        }

        let download_id = NodeId::derive("download", self.path.display());
        let chmod_id = NodeId::derive("chmod", self.path.display());

        let mut builder = FragmentBuilder::new();
        builder.add(
            download_id.clone(),
            ExecutionNode::new(
                format!("download {}", self.identity),
                download,
                [control.clone()],
            ),
        )?;
        builder.add(
            chmod_id,
            ExecutionNode::new(
                format!("install {}", self.identity),
                MarkExecutable {
                    path: self.path.clone(),
                },
                [control.clone()],
            )
            .depends_on([download_id]),
        )?;
        Ok(builder.build()?)
    }
}

// =============================================================================
// Remote archive
// =============================================================================

/// A binary (or the whole archive) taken from a downloaded archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArchive {
    identity: ResourceIdentity,
    url: String,
    archive: PathBuf,
    extract_dir: PathBuf,
    /// Archive-relative location of the requested binary, resolved under
    /// `extract_dir`
    source: Option<PathBuf>,
    path: PathBuf,
    checksum: Option<Checksum>,
}

impl RemoteArchive {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cached archive file.
    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    /// Directory the archive is unpacked into.
    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    fn download(&self) -> DownloadFile {
        DownloadFile {
            url: self.url.clone(),
            dest: self.archive.clone(),
            checksum: self.checksum.clone(),
        }
    }

    fn satisfied(&self, session: &PlanningSession) -> anyhow::Result<bool> {
        let ctx = session.exec_context();
        let control = session.control();
        if !ctx.connector.exists(control, &self.path)? {
            return Ok(false);
        }
        if self.checksum.is_none() {
            return Ok(true);
        }
        // The archive is what the digest describes.
        self.download().verified(&ctx, control)
    }
}

impl ResourceHandle for RemoteArchive {
    fn id(&self) -> String {
        self.identity.to_string()
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn placement(&self) -> Placement {
        Placement::ControlNode
    }

    fn ensure_plan(&self, session: &PlanningSession) -> Result<Fragment> {
        let control = session.control();
        if self
            .satisfied(session)
            .map_err(|e| Error::precheck(control, &e))?
        {
            log::debug!("{} already present at {}", self.identity, self.path.display());
            return Ok(Fragment::empty());
        }

        let download_id = NodeId::derive("download", self.archive.display());
        let mut builder = FragmentBuilder::new();
        builder.add(
            download_id.clone(),
            ExecutionNode::new(
                format!(
                    "download {}@{} ({})",
                    self.identity.component, self.identity.version, self.identity.arch
                ),
                self.download(),
                [control.clone()],
            ),
        )?;

        if let Some(source) = &self.source {
            let extract_id = NodeId::derive("extract", self.extract_dir.display());
            builder.add(
                extract_id.clone(),
                ExecutionNode::new(
                    format!(
                        "extract {}@{} ({})",
                        self.identity.component, self.identity.version, self.identity.arch
                    ),
                    ExtractArchive {
                        archive: self.archive.clone(),
                        dest_dir: self.extract_dir.clone(),
                    },
                    [control.clone()],
                )
                .depends_on([download_id]),
            )?;
            builder.add(
                NodeId::derive("finalize", self.path.display()),
                ExecutionNode::new(
                    format!("finalize {}", self.identity),
                    FinalizeBinary {
                        source: source.clone(),
                        dest: self.path.clone(),
                    },
                    [control.clone()],
                )
                .depends_on([extract_id]),
            )?;
        }

        log::debug!(
            "Planned {} node(s) for {}",
            builder.len(),
            self.identity
        );
        Ok(builder.build()?)
    }
}

// =============================================================================
// Local certificate
// =============================================================================

/// A certificate and key pair generated on the control node.
///
/// Generation needs the signing CA, which is itself a certificate handle,
/// so it is orchestrated by whoever composes the PKI. This handle only
/// locates the pair and reports whether it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCertificate {
    component: String,
    name: String,
    cert: PathBuf,
    key: PathBuf,
}

impl LocalCertificate {
    /// `<work>/<cluster>/certs/<component>/<name>.pem` and `<name>-key.pem`
    pub fn new(session: &PlanningSession, component: &str, name: &str) -> Self {
        let dir = session.certs_dir(component);
        Self {
            component: component.to_string(),
            name: name.to_string(),
            cert: dir.join(format!("{name}.pem")),
            key: dir.join(format!("{name}-key.pem")),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    pub fn key_path(&self) -> &Path {
        &self.key
    }

    /// Whether both the certificate and its key exist on the control node.
    pub fn present(&self, session: &PlanningSession) -> Result<bool> {
        let control = session.control();
        let connector = session.connector();
        let check = |path: &Path| {
            connector
                .exists(control, path)
                .map_err(|e| Error::precheck(control, &e))
        };
        Ok(check(&self.cert)? && check(&self.key)?)
    }
}

impl ResourceHandle for LocalCertificate {
    fn id(&self) -> String {
        format!("cert:{}/{}", self.component, self.name)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.cert)
    }

    fn placement(&self) -> Placement {
        Placement::ControlNode
    }

    fn ensure_plan(&self, session: &PlanningSession) -> Result<Fragment> {
        if self.present(session)? {
            log::debug!("Certificate {} present", self.cert.display());
        } else {
            log::debug!("Certificate {} missing, left to PKI generation", self.cert.display());
        }
        Ok(Fragment::empty())
    }
}

// =============================================================================
// Remote image
// =============================================================================

/// A container image pulled by the runtime on each target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    reference: String,
    runtime: ImageRuntime,
    hosts: Vec<Host>,
}

impl RemoteImage {
    pub fn new(reference: impl Into<String>, runtime: ImageRuntime, hosts: Vec<Host>) -> Self {
        let mut hosts = hosts;
        hosts.sort();
        hosts.dedup();
        Self {
            reference: reference.into(),
            runtime,
            hosts,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }
}

impl ResourceHandle for RemoteImage {
    fn id(&self) -> String {
        format!("image:{}", self.reference)
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn placement(&self) -> Placement {
        Placement::TargetHosts(self.hosts.clone())
    }

    fn ensure_plan(&self, _session: &PlanningSession) -> Result<Fragment> {
        let mut builder = FragmentBuilder::new();
        for host in &self.hosts {
            builder.add(
                NodeId::derive("pull", format!("{}@{}", self.reference, host)),
                ExecutionNode::new(
                    format!("pull {} on {}", self.reference, host),
                    PullImage {
                        reference: self.reference.clone(),
                        runtime: self.runtime,
                    },
                    [host.clone()],
                ),
            )?;
        }
        Ok(builder.build()?)
    }
}

// =============================================================================
// Closed set
// =============================================================================

/// Every handle kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle {
    Binary(RemoteBinary),
    Archive(RemoteArchive),
    Certificate(LocalCertificate),
    Image(RemoteImage),
}

impl Handle {
    /// Resolve a registry-backed artifact.
    ///
    /// Architecture and OS default to the control node's. The registry
    /// entry decides between a direct binary and an archive.
    pub fn remote(session: &PlanningSession, request: &ArtifactRequest) -> Result<Self> {
        if request.component.trim().is_empty() {
            return Err(Error::MissingParameter {
                component: request.component.clone(),
                parameter: "component name",
            });
        }
        if request.version.trim().is_empty() {
            return Err(Error::MissingParameter {
                component: request.component.clone(),
                parameter: "version",
            });
        }
        if !session.registry().contains(&request.component) {
            return Err(Error::UnknownComponent(request.component.clone()));
        }

        let platform = match (&request.arch, &request.os) {
            (Some(arch), Some(os)) => Platform::new(normalize_os(os)?, normalize_arch(arch)?),
            (arch, None) => session.platform_for(arch.as_deref())?,
            (None, Some(os)) => Platform::new(normalize_os(os)?, session.control_platform()?.arch),
        };

        let resolved = session.registry().resolve(
            &request.component,
            &request.version,
            &platform,
            session.mirror(),
        )?;
        let identity = ResourceIdentity::new(&request.component, &request.version, &platform)
            .with_binary(request.binary.clone());
        let dir = identity.artifact_dir(session.work_dir(), session.cluster());

        match resolved.binaries {
            None => {
                if let Some(binary) = &request.binary
                    && binary != &request.component
                {
                    return Err(Error::UnknownBinary {
                        component: request.component.clone(),
                        binary: binary.clone(),
                    });
                }
                Ok(Self::Binary(RemoteBinary {
                    identity,
                    url: resolved.url,
                    path: dir.join(&resolved.file),
                    checksum: request.checksum.clone(),
                }))
            }
            Some(binaries) => {
                let archive = dir.join(&resolved.file);
                let extract_dir = extraction_dir(&archive);
                let (source, path) = match &request.binary {
                    Some(binary) => {
                        let relative = binaries.get(binary).ok_or_else(|| Error::UnknownBinary {
                            component: request.component.clone(),
                            binary: binary.clone(),
                        })?;
                        (Some(extract_dir.join(relative)), extract_dir.join(binary))
                    }
                    None => (None, archive.clone()),
                };
                Ok(Self::Archive(RemoteArchive {
                    identity,
                    url: resolved.url,
                    archive,
                    extract_dir,
                    source,
                    path,
                    checksum: request.checksum.clone(),
                }))
            }
        }
    }

    /// Certificate and key named `name` for `component`.
    pub fn certificate(session: &PlanningSession, component: &str, name: &str) -> Self {
        Self::Certificate(LocalCertificate::new(session, component, name))
    }

    /// Image pulled on `hosts`.
    pub fn image(reference: impl Into<String>, runtime: ImageRuntime, hosts: Vec<Host>) -> Self {
        Self::Image(RemoteImage::new(reference, runtime, hosts))
    }

    fn inner(&self) -> &dyn ResourceHandle {
        match self {
            Self::Binary(h) => h,
            Self::Archive(h) => h,
            Self::Certificate(h) => h,
            Self::Image(h) => h,
        }
    }

    /// Path of the artifact for a file-backed handle.
    ///
    /// Images have no path on the control node.
    pub fn require_path(&self) -> Result<&Path> {
        self.path().ok_or_else(|| Error::MissingParameter {
            component: self.id(),
            parameter: "artifact path",
        })
    }
}

impl ResourceHandle for Handle {
    fn id(&self) -> String {
        self.inner().id()
    }

    fn path(&self) -> Option<&Path> {
        self.inner().path()
    }

    fn placement(&self) -> Placement {
        self.inner().placement()
    }

    fn ensure_plan(&self, session: &PlanningSession) -> Result<Fragment> {
        self.inner().ensure_plan(session)
    }
}
