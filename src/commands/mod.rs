pub mod apply;
pub mod components;
pub mod plan;

use crate::Context;
use crate::config::ClusterConfig;
use crate::connector::ShellConnector;
use crate::paths;
use anyhow::Result;
use artifacts::PlanningSession;
use execgraph::Connector;
use std::sync::Arc;

/// A loaded cluster file and the session planning runs against.
pub struct Workspace {
    pub config: ClusterConfig,
    pub session: PlanningSession,
}

impl Workspace {
    /// Load the cluster file and open a session on its control node.
    pub fn load(ctx: &Context) -> Result<Self> {
        let file = paths::config_file(ctx.config.as_deref());
        log::debug!("Loading cluster file {}", file.display());
        let config = ClusterConfig::load(&file)?;
        let connector: Arc<dyn Connector> = Arc::new(ShellConnector::new());
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClusterConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let work_dir = paths::work_dir(config.cluster.work_dir.as_deref())?;
        log::debug!("Work dir {}", work_dir.display());
        let session = PlanningSession::new(
            work_dir,
            config.cluster.name.clone(),
            config.control_host(),
            connector,
        )
        .with_registry(Arc::new(config.registry()))
        .with_mirror(config.cluster.mirror.clone());
        Ok(Self { config, session })
    }
}
