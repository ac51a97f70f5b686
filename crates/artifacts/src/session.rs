//! Planning sessions.
//!
//! A session is the explicit context every handle plans against: where the
//! artifact cache lives, which cluster it belongs to, which host is the
//! control node and how to reach it. Anything learned about the control
//! node during planning (its platform) is memoized here, for the lifetime
//! of one planning pass, and never on the handles themselves.

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::registry::ComponentRegistry;
use execgraph::{Connector, ExecContext, Host};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Context shared by every handle of one planning pass.
pub struct PlanningSession {
    work_dir: PathBuf,
    cluster: String,
    control: Host,
    connector: Arc<dyn Connector>,
    registry: Arc<ComponentRegistry>,
    mirror: Option<String>,
    platform: OnceLock<Platform>,
}

impl PlanningSession {
    /// Create a session using the built-in component registry.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        cluster: impl Into<String>,
        control: Host,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            cluster: cluster.into(),
            control,
            connector,
            registry: Arc::new(ComponentRegistry::builtin()),
            mirror: None,
            platform: OnceLock::new(),
        }
    }

    /// Replace the component registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Download every component from `mirror` instead of its default base.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Option<String>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The host artifacts are acquired on.
    pub fn control(&self) -> &Host {
        &self.control
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Shared handle to the connector, for executing what was planned.
    pub fn shared_connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn mirror(&self) -> Option<&str> {
        self.mirror.as_deref()
    }

    /// `<work_dir>/<cluster>`
    pub fn cluster_dir(&self) -> PathBuf {
        self.work_dir.join(&self.cluster)
    }

    /// `<work_dir>/<cluster>/certs/<component>`
    pub fn certs_dir(&self, component: &str) -> PathBuf {
        self.cluster_dir().join("certs").join(component)
    }

    /// Execution context for prechecks issued while planning.
    pub fn exec_context(&self) -> ExecContext<'_> {
        ExecContext::new(self.connector.as_ref())
    }

    /// Platform of the control node, queried once per session.
    ///
    /// An architecture pinned on the control host wins over what the host
    /// reports.
    pub fn control_platform(&self) -> Result<Platform> {
        if let Some(platform) = self.platform.get() {
            return Ok(platform.clone());
        }

        let facts = self
            .connector
            .facts(&self.control)
            .map_err(|e| Error::PlatformDetection {
                host: self.control.name.clone(),
                message: format!("{e:#}"),
            })?;
        let mut platform = Platform::from_facts(&facts)?;
        if let Some(arch) = &self.control.arch {
            platform = platform.with_arch(arch)?;
        }
        log::debug!("Control node {} is {}", self.control, platform);

        // A concurrent caller may have won the race; both computed the same value.
        let _ = self.platform.set(platform.clone());
        Ok(platform)
    }

    /// Platform to plan for: the control node's, with `arch` overriding
    /// its architecture when given.
    pub fn platform_for(&self, arch: Option<&str>) -> Result<Platform> {
        let control = self.control_platform()?;
        match arch {
            Some(arch) => control.with_arch(arch),
            None => Ok(control),
        }
    }
}

impl std::fmt::Debug for PlanningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningSession")
            .field("work_dir", &self.work_dir)
            .field("cluster", &self.cluster)
            .field("control", &self.control)
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}
