//! Progress bar for `apply`.

use crate::ui;
use colored::Colorize;
use execgraph::{NodeId, NodeOutcome, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;

const TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Reports executor progress on a terminal bar.
///
/// Failures are printed above the bar as they happen so they stay on
/// screen after it is cleared.
pub struct BarProgress {
    bar: ProgressBar,
    names: HashMap<NodeId, String>,
    verbose: bool,
}

impl BarProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            names: HashMap::new(),
            verbose,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }
}

impl ProgressCallback for BarProgress {
    fn on_start(&mut self, total: usize) {
        self.bar = ProgressBar::new(total as u64);
        self.bar.set_style(Self::style());
    }

    fn on_node_start(&mut self, id: &NodeId, name: &str) {
        self.names.insert(id.clone(), name.to_string());
        self.bar.set_message(ui::truncate(name, 50));
    }

    fn on_node_complete(&mut self, id: &NodeId, outcome: &NodeOutcome) {
        let name = self
            .names
            .remove(id)
            .unwrap_or_else(|| id.to_string());
        match outcome {
            NodeOutcome::Failed { error } => {
                self.bar.println(format!("  {} {}: {}", "✗".red(), name, error));
            }
            NodeOutcome::Changed if self.verbose => {
                self.bar.println(format!("  {} {}", "✓".green(), name));
            }
            _ => {}
        }
        self.bar.set_message(format!("{} {}", ui::outcome_symbol(outcome), ui::truncate(&name, 50)));
        self.bar.inc(1);
    }

    fn on_rollback(&mut self, id: &NodeId) {
        self.bar
            .println(format!("  {} rolled back {}", "↺".yellow(), id));
    }

    fn on_finish(&mut self) {
        self.bar.finish_and_clear();
    }
}
