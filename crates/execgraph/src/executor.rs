//! Concurrent execution of a fragment
//!
//! The coordinator runs in the caller's thread and hands ready nodes to a
//! rayon pool. A node becomes ready once every dependency finished with a
//! successful outcome. Nodes targeting several hosts fan out across the
//! pool as well, so one slow host does not hold up the rest.

use crate::context::{Connector, ExecContext, ProgressCallback};
use crate::fragment::Fragment;
use crate::node::{ExecutionNode, NodeId};
use crate::types::{ExecuteOptions, ExecuteSummary, Host, NodeOutcome};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

/// Cooperative cancellation signal shared with the executor.
///
/// Once cancelled, no further node is started; nodes already running are
/// allowed to finish, then every completed node that changed something is
/// rolled back in reverse completion order.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to every node of an executed fragment.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Final outcome per node
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    /// Nodes in the order they finished running
    pub completion_order: Vec<NodeId>,
    /// Nodes rolled back, in the order rollback was attempted
    pub rolled_back: Vec<NodeId>,
    /// Whether execution stopped because of cancellation
    pub cancelled: bool,
}

impl ExecutionReport {
    /// Outcome of one node.
    pub fn outcome(&self, id: &NodeId) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    /// Aggregate counts.
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for outcome in self.outcomes.values() {
            summary.add_outcome(outcome);
        }
        summary.rolled_back = self.rolled_back.len();
        summary
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.summary().is_success()
    }

    /// Nodes that failed, with their error.
    pub fn failures(&self) -> impl Iterator<Item = (&NodeId, &str)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            NodeOutcome::Failed { error } => Some((id, error.as_str())),
            _ => None,
        })
    }
}

/// Message sent from a worker back to the coordinator.
struct Finished {
    id: NodeId,
    outcome: NodeOutcome,
    changed_hosts: Vec<Host>,
}

enum HostResult {
    Satisfied,
    Changed,
    WouldChange,
}

/// Execute a fragment in dependency order.
///
/// Returns an error only when the worker pool cannot be created. Node
/// failures are reported through [`ExecutionReport::outcomes`].
pub fn execute(
    fragment: &Fragment,
    connector: &dyn Connector,
    options: &ExecuteOptions,
    cancel: &CancelToken,
    progress: &mut dyn ProgressCallback,
) -> Result<ExecutionReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .thread_name(|i| format!("execgraph-worker-{i}"))
        .build()
        .context("Failed to create worker pool")?;

    let ctx = ExecContext {
        connector,
        verbose: options.verbose,
    };
    let dry_run = options.dry_run;
    let dependents = fragment.dependents();

    let mut remaining: HashMap<&NodeId, usize> = fragment
        .nodes()
        .map(|(id, node)| (id, node.dependencies().len()))
        .collect();
    let mut ready: BTreeSet<NodeId> = fragment.entry_nodes().clone();
    let mut report = ExecutionReport::default();
    let mut changed_hosts: HashMap<NodeId, Vec<Host>> = HashMap::new();
    let mut failed: Vec<NodeId> = Vec::new();

    progress.on_start(fragment.len());

    let (tx, rx) = mpsc::channel::<Finished>();
    pool.in_place_scope(|scope| {
        let mut running = 0usize;
        loop {
            if !cancel.is_cancelled() {
                while let Some(id) = ready.pop_first() {
                    let Some(node) = fragment.get(&id) else {
                        continue;
                    };
                    progress.on_node_start(&id, node.name());
                    running += 1;

                    let tx = tx.clone();
                    let ctx = &ctx;
                    scope.spawn(move |_| {
                        let (outcome, changed_hosts) = run_node(ctx, &id, node, dry_run);
                        // The coordinator outlives every worker
                        let _ = tx.send(Finished {
                            id,
                            outcome,
                            changed_hosts,
                        });
                    });
                }
            }

            if running == 0 {
                break;
            }
            let Ok(finished) = rx.recv() else {
                break;
            };
            running -= 1;

            let Finished {
                id,
                outcome,
                changed_hosts: hosts,
            } = finished;
            progress.on_node_complete(&id, &outcome);
            report.completion_order.push(id.clone());
            if !hosts.is_empty() {
                changed_hosts.insert(id.clone(), hosts);
            }

            if outcome.is_success() {
                for dependent in dependents.get(&id).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && !report.outcomes.contains_key(dependent) {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            } else {
                for blocked in fragment.descendants_of(&id) {
                    if !report.outcomes.contains_key(&blocked) {
                        log::debug!("Node {} blocked by failure of {}", blocked, id);
                        progress.on_node_complete(&blocked, &NodeOutcome::Blocked);
                        report.outcomes.insert(blocked, NodeOutcome::Blocked);
                    }
                }
                failed.push(id.clone());
            }
            report.outcomes.insert(id, outcome);
        }
    });

    let to_roll_back = if cancel.is_cancelled() {
        report.cancelled = true;
        for id in fragment.ids() {
            if !report.outcomes.contains_key(&id) {
                progress.on_node_complete(&id, &NodeOutcome::Cancelled);
                report.outcomes.insert(id, NodeOutcome::Cancelled);
            }
        }
        changed_in_reverse(&report, |_| true)
    } else if failed.is_empty() {
        Vec::new()
    } else {
        let mut ancestors = BTreeSet::new();
        for id in &failed {
            ancestors.extend(fragment.ancestors_of(id));
        }
        changed_in_reverse(&report, |id| {
            ancestors.contains(id)
                && !fragment.descendants_of(id).iter().any(|d| {
                    report
                        .outcomes
                        .get(d)
                        .is_some_and(NodeOutcome::is_success)
                })
        })
    };

    for id in to_roll_back {
        let Some(node) = fragment.get(&id) else {
            continue;
        };
        for host in changed_hosts.get(&id).into_iter().flatten() {
            log::info!("Rolling back {} on {}", node.name(), host);
            if let Err(e) = node.operation().rollback(&ctx, host) {
                log::warn!("Rollback of {} on {} failed: {:#}", id, host, e);
            }
        }
        progress.on_rollback(&id);
        report.rolled_back.push(id);
    }

    progress.on_finish();
    Ok(report)
}

/// Completed `Changed` nodes accepted by `keep`, latest completion first.
fn changed_in_reverse<F>(report: &ExecutionReport, keep: F) -> Vec<NodeId>
where
    F: Fn(&NodeId) -> bool,
{
    report
        .completion_order
        .iter()
        .rev()
        .filter(|id| report.outcomes.get(*id) == Some(&NodeOutcome::Changed))
        .filter(|id| keep(id))
        .cloned()
        .collect()
}

fn run_node(
    ctx: &ExecContext,
    id: &NodeId,
    node: &ExecutionNode,
    dry_run: bool,
) -> (NodeOutcome, Vec<Host>) {
    let results: Vec<(&Host, Result<HostResult>)> = if node.hosts().len() > 1 {
        node.hosts()
            .par_iter()
            .map(|host| (host, run_on_host(ctx, node, host, dry_run)))
            .collect()
    } else {
        node.hosts()
            .iter()
            .map(|host| (host, run_on_host(ctx, node, host, dry_run)))
            .collect()
    };

    let mut errors = Vec::new();
    let mut changed = Vec::new();
    let mut would_change = false;
    for (host, result) in results {
        match result {
            Ok(HostResult::Satisfied) => {}
            Ok(HostResult::Changed) => changed.push(host.clone()),
            Ok(HostResult::WouldChange) => would_change = true,
            Err(e) => errors.push(format!("{host}: {e:#}")),
        }
    }

    let outcome = if !errors.is_empty() {
        log::error!("Node {} failed: {}", id, errors.join("; "));
        NodeOutcome::Failed {
            error: errors.join("; "),
        }
    } else if !changed.is_empty() {
        NodeOutcome::Changed
    } else if would_change {
        NodeOutcome::WouldChange
    } else {
        NodeOutcome::Satisfied
    };
    (outcome, changed)
}

fn run_on_host(
    ctx: &ExecContext,
    node: &ExecutionNode,
    host: &Host,
    dry_run: bool,
) -> Result<HostResult> {
    let op = node.operation();
    if op.precheck(ctx, host)? {
        log::debug!("{} already satisfied on {}", node.name(), host);
        return Ok(HostResult::Satisfied);
    }
    if dry_run {
        return Ok(HostResult::WouldChange);
    }
    log::info!("{} on {}", op.describe(), host);
    op.run(ctx, host)?;
    Ok(HostResult::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::fragment::FragmentBuilder;
    use crate::node::Operation;
    use crate::testing::{EventLog, MockConnector, Scripted};

    fn control() -> Host {
        Host::local("control")
    }

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn run(fragment: &Fragment, options: &ExecuteOptions, cancel: &CancelToken) -> ExecutionReport {
        let mock = MockConnector::new();
        execute(fragment, &mock, options, cancel, &mut NoProgress).unwrap()
    }

    fn build(nodes: Vec<(&str, ExecutionNode)>) -> Fragment {
        let mut builder = FragmentBuilder::new();
        for (name, node) in nodes {
            builder.add(id(name), node).unwrap();
        }
        builder.build().unwrap()
    }

    fn scripted(tag: &str, op: Scripted) -> ExecutionNode {
        ExecutionNode::new(tag, op, [control()])
    }

    /// Cancels the token when it runs.
    #[derive(Debug)]
    struct CancelOnRun(CancelToken);

    impl Operation for CancelOnRun {
        fn kind(&self) -> &'static str {
            "cancel"
        }
        fn describe(&self) -> String {
            "cancel".into()
        }
        fn fingerprint(&self) -> String {
            String::new()
        }
        fn precheck(&self, _ctx: &ExecContext, _host: &Host) -> Result<bool> {
            Ok(false)
        }
        fn run(&self, _ctx: &ExecContext, _host: &Host) -> Result<()> {
            self.0.cancel();
            Ok(())
        }
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[test]
    fn test_runs_in_dependency_order() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log))),
            ("b", scripted("b", Scripted::new("b", &log)).depends_on([id("a")])),
            ("c", scripted("c", Scripted::new("c", &log)).depends_on([id("b")])),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        assert_eq!(log.of("run"), vec!["a@control", "b@control", "c@control"]);
        assert_eq!(report.summary().changed, 3);
        assert!(report.is_success());
        assert_eq!(report.completion_order, vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn test_single_worker_runs_a_diamond() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("root", scripted("root", Scripted::new("root", &log))),
            ("left", scripted("left", Scripted::new("left", &log)).depends_on([id("root")])),
            ("right", scripted("right", Scripted::new("right", &log)).depends_on([id("root")])),
            (
                "join",
                scripted("join", Scripted::new("join", &log)).depends_on([id("left"), id("right")]),
            ),
        ]);
        let options = ExecuteOptions {
            jobs: 1,
            ..Default::default()
        };

        let report = run(&fragment, &options, &CancelToken::new());
        let runs = log.of("run");
        assert_eq!(runs.len(), 4);
        assert_eq!(runs.first().map(String::as_str), Some("root@control"));
        assert_eq!(runs.last().map(String::as_str), Some("join@control"));
        assert!(report.is_success());
    }

    #[test]
    fn test_multi_host_node_runs_on_every_host() {
        let log = EventLog::new();
        let hosts = [
            Host::new("node1", "10.0.0.1"),
            Host::new("node2", "10.0.0.2"),
            Host::new("node3", "10.0.0.3"),
        ];
        let fragment = build(vec![(
            "pull",
            ExecutionNode::new("pull", Scripted::new("pull", &log), hosts),
        )]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        let mut runs = log.of("run");
        runs.sort();
        assert_eq!(runs, vec!["pull@node1", "pull@node2", "pull@node3"]);
        assert_eq!(report.outcome(&id("pull")), Some(&NodeOutcome::Changed));
    }

    // ==========================================================================
    // Idempotency and dry run
    // ==========================================================================

    #[test]
    fn test_satisfied_nodes_are_not_run() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log).satisfied())),
            ("b", scripted("b", Scripted::new("b", &log)).depends_on([id("a")])),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        assert_eq!(log.of("run"), vec!["b@control"]);
        assert_eq!(report.outcome(&id("a")), Some(&NodeOutcome::Satisfied));
        assert_eq!(report.outcome(&id("b")), Some(&NodeOutcome::Changed));
    }

    #[test]
    fn test_dry_run_only_prechecks() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log))),
            ("b", scripted("b", Scripted::new("b", &log).satisfied()).depends_on([id("a")])),
        ]);
        let options = ExecuteOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = run(&fragment, &options, &CancelToken::new());
        assert!(log.events().is_empty());
        assert_eq!(report.outcome(&id("a")), Some(&NodeOutcome::WouldChange));
        assert_eq!(report.outcome(&id("b")), Some(&NodeOutcome::Satisfied));
        assert!(report.rolled_back.is_empty());
    }

    // ==========================================================================
    // Failure and rollback
    // ==========================================================================

    #[test]
    fn test_failure_blocks_dependents_and_rolls_back_branch() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log))),
            ("b", scripted("b", Scripted::new("b", &log).failing()).depends_on([id("a")])),
            ("c", scripted("c", Scripted::new("c", &log)).depends_on([id("b")])),
            ("d", scripted("d", Scripted::new("d", &log))),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        assert!(matches!(report.outcome(&id("b")), Some(NodeOutcome::Failed { .. })));
        assert_eq!(report.outcome(&id("c")), Some(&NodeOutcome::Blocked));
        assert_eq!(report.outcome(&id("d")), Some(&NodeOutcome::Changed));
        assert_eq!(report.rolled_back, vec![id("a")]);
        assert_eq!(log.of("rollback"), vec!["a@control"]);
        assert!(!log.of("run").contains(&"c@control".to_string()));

        let summary = report.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.rolled_back, 1);
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_ancestor_with_successful_dependent_is_kept() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("root", scripted("root", Scripted::new("root", &log))),
            ("ok", scripted("ok", Scripted::new("ok", &log)).depends_on([id("root")])),
            (
                "bad",
                scripted("bad", Scripted::new("bad", &log).failing()).depends_on([id("root")]),
            ),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        assert_eq!(report.outcome(&id("ok")), Some(&NodeOutcome::Changed));
        assert!(report.rolled_back.is_empty());
        assert!(log.of("rollback").is_empty());
    }

    #[test]
    fn test_rollback_failure_is_logged_not_propagated() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log).failing_rollback())),
            ("b", scripted("b", Scripted::new("b", &log).failing()).depends_on([id("a")])),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &CancelToken::new());
        assert_eq!(report.rolled_back, vec![id("a")]);
        assert_eq!(log.of("rollback"), vec!["a@control"]);
    }

    // ==========================================================================
    // Cancellation
    // ==========================================================================

    #[test]
    fn test_cancelled_before_start_runs_nothing() {
        let log = EventLog::new();
        let fragment = build(vec![("a", scripted("a", Scripted::new("a", &log)))]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = run(&fragment, &ExecuteOptions::default(), &cancel);
        assert!(report.cancelled);
        assert!(log.events().is_empty());
        assert_eq!(report.outcome(&id("a")), Some(&NodeOutcome::Cancelled));
        assert!(!report.is_success());
    }

    #[test]
    fn test_cancel_rolls_back_completed_nodes_in_reverse_order() {
        let log = EventLog::new();
        let cancel = CancelToken::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log))),
            ("b", scripted("b", Scripted::new("b", &log)).depends_on([id("a")])),
            (
                "c",
                ExecutionNode::new("c", CancelOnRun(cancel.clone()), [control()])
                    .depends_on([id("b")]),
            ),
            ("d", scripted("d", Scripted::new("d", &log)).depends_on([id("c")])),
        ]);

        let report = run(&fragment, &ExecuteOptions::default(), &cancel);
        assert!(report.cancelled);
        assert_eq!(report.outcome(&id("d")), Some(&NodeOutcome::Cancelled));
        assert_eq!(report.rolled_back, vec![id("c"), id("b"), id("a")]);
        assert_eq!(log.of("rollback"), vec!["b@control", "a@control"]);
        assert!(!log.of("run").contains(&"d@control".to_string()));
    }

    // ==========================================================================
    // Progress
    // ==========================================================================

    #[derive(Default)]
    struct Recorder {
        total: usize,
        started: usize,
        completed: usize,
        finished: bool,
    }

    impl ProgressCallback for Recorder {
        fn on_start(&mut self, total: usize) {
            self.total = total;
        }
        fn on_node_start(&mut self, _id: &NodeId, _name: &str) {
            self.started += 1;
        }
        fn on_node_complete(&mut self, _id: &NodeId, _outcome: &NodeOutcome) {
            self.completed += 1;
        }
        fn on_finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn test_progress_sees_every_node() {
        let log = EventLog::new();
        let fragment = build(vec![
            ("a", scripted("a", Scripted::new("a", &log).failing())),
            ("b", scripted("b", Scripted::new("b", &log)).depends_on([id("a")])),
        ]);
        let mock = MockConnector::new();
        let mut recorder = Recorder::default();

        execute(
            &fragment,
            &mock,
            &ExecuteOptions::default(),
            &CancelToken::new(),
            &mut recorder,
        )
        .unwrap();
        assert_eq!(recorder.total, 2);
        assert_eq!(recorder.started, 1);
        assert_eq!(recorder.completed, 2);
        assert!(recorder.finished);
    }

    #[test]
    fn test_empty_fragment_is_a_successful_no_op() {
        let report = run(&Fragment::empty(), &ExecuteOptions::default(), &CancelToken::new());
        assert!(report.outcomes.is_empty());
        assert!(report.is_success());
    }
}
