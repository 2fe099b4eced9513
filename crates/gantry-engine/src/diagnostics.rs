//! Human-readable plan and summary output for the CLI.

use crate::graph::Plan;
use crate::schedule::ExecutionSummary;
use crate::task::{Action, SkipReason, TaskState};
use crate::workspace::ReportEntry;

/// One line per planned node, in execution order.
pub fn plan_lines(plan: &Plan<'_>) -> Vec<String> {
    plan.nodes()
        .enumerate()
        .map(|(i, node)| {
            let action = match &node.action {
                Action::Noop => "lifecycle".to_owned(),
                Action::Command(spec) => spec.argv.join(" "),
                Action::Func { label, .. } => label.clone(),
            };
            format!("{:>4}. {} [{action}]", i + 1, node.id)
        })
        .collect()
}

/// Print the plan of a `--dry-run` invocation to stderr.
pub fn print_plan(plan: &Plan<'_>) {
    eprintln!("    Planned {} task(s)", plan.len());
    for line in plan_lines(plan) {
        eprintln!("{line}");
    }
}

/// Totals line, failures, and the index of reports written by this run.
pub fn summary_lines(summary: &ExecutionSummary, reports: &[ReportEntry]) -> Vec<String> {
    let succeeded = summary.count(|s| matches!(s, TaskState::Succeeded));
    let up_to_date = summary.count(|s| matches!(s, TaskState::Skipped(SkipReason::UpToDate)));
    let skipped = summary.count(|s| {
        matches!(s, TaskState::Skipped(reason) if *reason != SkipReason::UpToDate)
    });
    let failed = summary.failed();

    let mut lines = vec![format!(
        "{:>12} in {:.2}s: {succeeded} executed, {up_to_date} up-to-date, {skipped} skipped, {} failed",
        if failed.is_empty() { "Finished" } else { "Failed" },
        summary.duration.as_secs_f64(),
        failed.len(),
    )];
    for result in &failed {
        if let TaskState::Failed(cause) = &result.state {
            lines.push(format!("{:>12} {}: {cause}", "Failed", result.id));
        }
    }
    for report in reports {
        let produced = summary
            .result(&report.task)
            .is_some_and(|r| matches!(r.state, TaskState::Succeeded | TaskState::Skipped(SkipReason::UpToDate)));
        if produced {
            lines.push(format!(
                "{:>12} {} ({}) {}",
                "Report",
                report.name,
                report.kind,
                report.output.display()
            ));
        }
    }
    lines
}

/// Print the invocation summary to stderr.
pub fn print_summary(summary: &ExecutionSummary, reports: &[ReportEntry]) {
    for line in summary_lines(summary, reports) {
        eprintln!("{line}");
    }
}
