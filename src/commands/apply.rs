//! `clusterforge apply`

use super::Workspace;
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::BarProgress;
use crate::tasks::plan_cluster;
use crate::ui;
use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use execgraph::{CancelToken, ExecuteOptions, ExecutionReport, Fragment, execute};

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let workspace = Workspace::load(ctx)?;
    let fragment = plan_cluster(&workspace.config, &workspace.session)?;

    ui::header(&format!("Applying {}", workspace.session.cluster()));
    let hosts = workspace.config.inventory().hosts().len();
    ui::kv("hosts", &hosts.to_string());
    ui::kv("operations", &fragment.len().to_string());

    if !args.yes && !args.dry_run && !fragment.is_empty() && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);

    let options = ExecuteOptions {
        dry_run: args.dry_run,
        jobs: args.jobs,
        verbose: ctx.verbose > 0,
    };
    let report = apply(&fragment, &workspace, &options, &cancel)?;

    let summary = report.summary();
    print_failures(&report);
    ui::print_summary(&summary);
    if args.dry_run {
        ui::info("Dry run - no changes made");
    }
    if !summary.is_success() {
        bail!("Apply did not complete");
    }
    Ok(())
}

fn apply(
    fragment: &Fragment,
    workspace: &Workspace,
    options: &ExecuteOptions,
    cancel: &CancelToken,
) -> Result<ExecutionReport> {
    let connector = workspace.session.shared_connector();
    let mut progress = BarProgress::new(options.verbose);
    execute(fragment, connector.as_ref(), options, cancel, &mut progress)
        .context("Failed to start execution")
}

/// Stop scheduling new operations on Ctrl-C; running ones finish.
fn install_interrupt_handler(cancel: &CancelToken) {
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n{} Interrupted, waiting for running operations", "■".yellow());
        token.cancel();
    }) {
        log::warn!("Could not install interrupt handler: {}", e);
    }
}

fn print_failures(report: &ExecutionReport) {
    let failures: Vec<_> = report.failures().collect();
    if failures.is_empty() {
        return;
    }
    ui::section("Failures");
    for (id, error) in failures {
        ui::error(&format!("{id}: {error}"));
    }
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}
