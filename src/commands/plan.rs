//! `clusterforge plan`

use super::Workspace;
use crate::Context;
use crate::tasks::plan_cluster;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use execgraph::Fragment;
use serde::Serialize;

/// One node as printed by `plan --json`.
#[derive(Debug, Serialize)]
struct PlannedNode {
    id: String,
    name: String,
    kind: &'static str,
    description: String,
    hosts: Vec<String>,
    depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PlanReport {
    cluster: String,
    entry: Vec<String>,
    exit: Vec<String>,
    nodes: Vec<PlannedNode>,
}

pub fn run(ctx: &Context, json: bool) -> Result<()> {
    let workspace = Workspace::load(ctx)?;
    let fragment = plan_cluster(&workspace.config, &workspace.session)?;
    let report = report(workspace.session.cluster(), &fragment);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print(ctx, &report);
    Ok(())
}

fn report(cluster: &str, fragment: &Fragment) -> PlanReport {
    let nodes = fragment
        .topological_order()
        .into_iter()
        .filter_map(|id| {
            let node = fragment.get(&id)?;
            Some(PlannedNode {
                id: id.to_string(),
                name: node.name().to_string(),
                kind: node.operation().kind(),
                description: node.operation().describe(),
                hosts: node.hosts().iter().map(|h| h.name.clone()).collect(),
                depends_on: node.dependencies().iter().map(ToString::to_string).collect(),
            })
        })
        .collect();

    PlanReport {
        cluster: cluster.to_string(),
        entry: fragment.entry_nodes().iter().map(ToString::to_string).collect(),
        exit: fragment.exit_nodes().iter().map(ToString::to_string).collect(),
        nodes,
    }
}

fn print(ctx: &Context, report: &PlanReport) {
    ui::header(&format!("Plan for {}", report.cluster));
    if report.nodes.is_empty() {
        println!();
        ui::success("Nothing to do: every artifact is already acquired");
        return;
    }

    for node in &report.nodes {
        println!(
            "  {} {} {}",
            format!("{:>9}", node.kind).cyan(),
            node.name,
            format!("[{}]", node.hosts.join(", ")).dimmed()
        );
        if ctx.verbose > 0 {
            ui::dim(&format!("    {}", node.description));
            for dep in &node.depends_on {
                ui::dim(&format!("    after {dep}"));
            }
        }
    }

    println!();
    ui::kv("operations", &report.nodes.len().to_string());
    ui::kv("entry points", &report.entry.len().to_string());
    ui::kv("final steps", &report.exit.len().to_string());
    if !ctx.quiet {
        println!();
        ui::info("Operations already satisfied on a host are skipped by apply");
    }
}
