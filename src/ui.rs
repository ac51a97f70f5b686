use colored::Colorize;
use execgraph::{ExecuteSummary, NodeOutcome};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Symbol shown next to a node with this outcome.
pub fn outcome_symbol(outcome: &NodeOutcome) -> &'static str {
    match outcome {
        NodeOutcome::Satisfied => "○",
        NodeOutcome::Changed => "✓",
        NodeOutcome::WouldChange => "~",
        NodeOutcome::Failed { .. } => "✗",
        NodeOutcome::Blocked => "⊘",
        NodeOutcome::Cancelled => "■",
    }
}

/// One line summarizing an execution.
pub fn summary_line(summary: &ExecuteSummary) -> String {
    let mut parts = Vec::new();
    let counts = [
        (summary.changed, "changed"),
        (summary.would_change, "would change"),
        (summary.satisfied, "unchanged"),
        (summary.failed, "failed"),
        (summary.blocked, "blocked"),
        (summary.cancelled, "cancelled"),
        (summary.rolled_back, "rolled back"),
    ];
    for (count, label) in counts {
        if count > 0 {
            parts.push(format!("{count} {label}"));
        }
    }
    if parts.is_empty() {
        return "nothing to do".to_string();
    }
    parts.join(", ")
}

/// Print the final summary of an execution.
pub fn print_summary(summary: &ExecuteSummary) {
    println!();
    let line = summary_line(summary);
    if summary.is_success() {
        success(&line);
    } else {
        error(&line);
    }
}

/// Truncate a string for display, keeping the end
pub fn truncate(text: &str, max_len: usize) -> String {
    let len = text.chars().count();
    if len <= max_len {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let tail: String = text.chars().skip(len - (max_len - 3)).collect();
        format!("...{tail}")
    }
}

// ============================================================================
// Tests
// ============================================================================
