//! Text summary builder for CLI output.
//!
//! Formats persisted run records into human-readable lines.

use crate::model::{RunRecord, RunStatus, StepStatus};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn step_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Queued => "·",
        StepStatus::Running => "▶",
        StepStatus::Success => "✓",
        StepStatus::Fail => "✗",
        StepStatus::Skipped => "-",
    }
}

/// Build the detail view for one run.
pub(crate) fn build_text_summary(run: &RunRecord) -> TextSummary {
    let opts = &run.spec.options;
    let mut lines = vec![
        format!("Run:        {}", run.run_id),
        format!("Status:     {}", run.status.as_str()),
        format!(
            "Target:     {} ({}, max {} iterations, coverage >= {}%)",
            run.spec.function_name,
            opts.test_style.as_str(),
            opts.max_iterations,
            opts.coverage_threshold
        ),
        format!("Created:    {}", run.created_at),
        format!("Updated:    {}", run.updated_at),
        "Steps:".to_string(),
    ];

    for step in &run.steps {
        let mut line = format!("  {} {}", step_icon(step.status), step.name.label());
        if let Some(err) = step.error.as_deref() {
            line.push_str(&format!(" ({err})"));
        }
        lines.push(line);
    }

    let edge = opts.edge_case_categories.enabled();
    if !edge.is_empty() {
        lines.push(format!("Edge cases: {}", edge.join(", ")));
    }

    // Nothing below exists until the pipeline has produced it.
    if run.status == RunStatus::Queued {
        return TextSummary { lines };
    }

    let cov = &run.coverage_summary;
    if cov.lines > 0.0 || !cov.files.is_empty() {
        let mut line = format!(
            "Coverage:   lines {:.1}% branches {:.1}% functions {:.1}%",
            cov.lines, cov.branches, cov.functions
        );
        if cov.lines < f64::from(opts.coverage_threshold) {
            line.push_str(&format!(" (below {}% threshold)", opts.coverage_threshold));
        }
        lines.push(line);
        for f in &cov.files {
            lines.push(format!(
                "  {} {:.1}% ({} lines, {} branches)",
                f.filename, f.percent, f.lines, f.branches
            ));
        }
    }
    if run.iterations_used > 0 {
        lines.push(format!(
            "Iterations: {}/{}",
            run.iterations_used, opts.max_iterations
        ));
    }
    if !run.artifacts_path.is_empty() {
        lines.push(format!("Artifacts:  {}", run.artifacts_path));
    }
    if let Some(pr) = run.pr.as_ref() {
        let url = pr.url.as_deref().unwrap_or("not opened");
        lines.push(format!("PR:         {} ({url})", pr.title));
    }

    TextSummary { lines }
}

/// One line per run, newest first, as returned by the store.
pub(crate) fn history_lines(runs: &[RunRecord]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["No runs yet.".to_string()];
    }
    let mut lines = vec![format!(
        "{:<28} {:<10} {:<24} {:<26} {}",
        "RUN", "STATUS", "TARGET", "CREATED", "COVERAGE"
    )];
    for run in runs {
        let coverage = if run.coverage_summary.lines > 0.0 {
            format!("{:.0}%", run.coverage_summary.lines)
        } else {
            "-".to_string()
        };
        lines.push(format!(
            "{:<28} {:<10} {:<24} {:<26} {}",
            run.run_id,
            run.status.as_str(),
            run.spec.function_name,
            run.created_at,
            coverage
        ));
    }
    lines
}
