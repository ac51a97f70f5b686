//! `clusterforge components`

use crate::Context;
use crate::config::ClusterConfig;
use crate::paths;
use crate::ui;
use anyhow::Result;
use artifacts::{ComponentRegistry, SourceKind};
use colored::Colorize;

pub fn run(ctx: &Context) -> Result<()> {
    // Overrides come from the cluster file when there is one.
    let file = paths::config_file(ctx.config.as_deref());
    let registry = if file.exists() {
        ClusterConfig::load(&file)?.registry()
    } else {
        log::debug!("No cluster file at {}, showing built-in components", file.display());
        ComponentRegistry::builtin()
    };

    ui::header("Components");
    for line in describe(&registry) {
        println!("{line}");
    }
    Ok(())
}

fn describe(registry: &ComponentRegistry) -> Vec<String> {
    let mut lines = Vec::new();
    for name in registry.names() {
        let Some(spec) = registry.get(name) else {
            continue;
        };
        let detail = match &spec.source {
            SourceKind::Binary => "binary".to_string(),
            SourceKind::Archive { binaries } => {
                let keys: Vec<&str> = binaries.keys().map(String::as_str).collect();
                format!("archive: {}", keys.join(", "))
            }
        };
        lines.push(format!(
            "  {} {} {}",
            format!("{name:<24}").bold(),
            detail,
            spec.base_url.dimmed()
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_builtin() {
        colored::control::set_override(false);
        let lines = describe(&ComponentRegistry::builtin());
        let etcd = lines.iter().find(|l| l.trim_start().starts_with("etcd ")).unwrap();
        assert!(etcd.contains("archive: etcd, etcdctl, etcdutl"));
        let kubelet = lines.iter().find(|l| l.trim_start().starts_with("kubelet ")).unwrap();
        assert!(kubelet.contains("binary https://dl.k8s.io/release"));
    }
}
