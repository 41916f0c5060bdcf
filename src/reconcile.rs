//! Folds driver events into a run record.
//!
//! `apply` is pure: it takes the current record and one event and returns the
//! next record. Events are applied in arrival order; nothing is reordered or
//! deduplicated here.

use crate::model::{now_rfc3339, RunEvent, RunPatch, RunRecord, RunStatus, StepName, StepStatus};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub fn apply(mut record: RunRecord, event: &RunEvent) -> RunRecord {
    if record.status.is_terminal() && !matches!(event, RunEvent::Log { .. }) {
        tracing::debug!(
            run_id = %record.run_id,
            status = record.status.as_str(),
            event = event.kind(),
            "ignoring event for finished run"
        );
        return record;
    }

    match event {
        RunEvent::Log { .. } => {}
        RunEvent::StepStart { step, timestamp } => {
            match record.step(*step).map(|s| s.status) {
                None => {
                    tracing::warn!(run_id = %record.run_id, step = step.as_str(), "step_start for unknown step");
                    return record;
                }
                Some(status) if status.is_finished() => {
                    tracing::warn!(step = step.as_str(), "step_start for a finished step ignored");
                    return record;
                }
                Some(_) => {}
            }
            close_other_running(&mut record, *step, timestamp);
            if let Some(s) = record.step_mut(*step) {
                s.status = StepStatus::Running;
                s.started_at = Some(timestamp.clone());
                s.completed_at = None;
                s.error = None;
            }
            record.status = RunStatus::Running;
            record.updated_at = timestamp.clone();
        }
        RunEvent::StepComplete {
            step,
            data,
            timestamp,
        } => {
            if let Some(patch) = data {
                merge(&mut record, patch);
            }
            match record.step_mut(*step) {
                Some(s) if s.status == StepStatus::Fail => {
                    tracing::warn!(step = step.as_str(), "step_complete for a failed step ignored");
                }
                Some(s) => {
                    s.status = StepStatus::Success;
                    if s.started_at.is_none() {
                        s.started_at = Some(timestamp.clone());
                    }
                    s.completed_at = Some(timestamp.clone());
                }
                None => {
                    tracing::warn!(run_id = %record.run_id, step = step.as_str(), "step_complete for unknown step");
                }
            }
            if record.status == RunStatus::Queued {
                record.status = RunStatus::Running;
            }
            record.updated_at = timestamp.clone();
        }
        RunEvent::StepError {
            step,
            message,
            timestamp,
        } => {
            if let Some(s) = record.step_mut(*step) {
                s.status = StepStatus::Fail;
                s.error = Some(message.clone());
                s.completed_at = Some(timestamp.clone());
            }
            record.status = RunStatus::Failed;
            record.updated_at = timestamp.clone();
        }
        RunEvent::RunComplete { data, timestamp } => {
            let mut final_status = RunStatus::Success;
            if let Some(patch) = data {
                merge(&mut record, patch);
                if let Some(s @ (RunStatus::Failed | RunStatus::Cancelled)) = patch.status {
                    final_status = s;
                }
            }
            record.status = final_status;
            record.updated_at = timestamp.clone();
        }
    }
    record
}

/// Shallow overwrite of the fields present in `patch`, keeping run-level invariants:
/// terminal statuses only arrive through `step_error`/`run_complete`, finished steps
/// never regress, and `iterations_used` only grows up to `max_iterations`.
fn merge(record: &mut RunRecord, patch: &RunPatch) {
    if let Some(status) = patch.status {
        if !status.is_terminal() {
            record.status = status;
        }
    }
    if let Some(v) = &patch.inferred_spec {
        record.inferred_spec = v.clone();
    }
    if let Some(v) = &patch.edge_cases {
        record.edge_cases = v.clone();
    }
    if let Some(v) = &patch.generated_tests {
        record.generated_tests = v.clone();
    }
    if let Some(v) = &patch.test_run_output {
        record.test_run_output = v.clone();
    }
    if let Some(v) = &patch.coverage_summary {
        record.coverage_summary = v.clone();
    }
    if let Some(v) = &patch.patch_diff {
        record.patch_diff = v.clone();
    }
    if let Some(v) = &patch.pr {
        record.pr = Some(v.clone());
    }
    if let Some(v) = &patch.artifacts_path {
        record.artifacts_path = v.clone();
    }
    if let Some(n) = patch.iterations_used {
        let max = record.spec.options.max_iterations;
        let next = n.max(record.iterations_used).min(max);
        if next != n {
            tracing::debug!(reported = n, kept = next, "iterations_used clamped");
        }
        record.iterations_used = next;
    }
    if let Some(steps) = &patch.steps {
        for incoming in steps {
            let Some(current) = record.step_mut(incoming.name) else {
                tracing::debug!(step = incoming.name.as_str(), "patch names a step this run does not have");
                continue;
            };
            if current.status.is_finished() {
                continue;
            }
            *current = incoming.clone();
        }
        let latest_running = record
            .steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.name);
        if let Some(keep) = latest_running {
            let at = patch.updated_at.clone().unwrap_or_else(now_rfc3339);
            close_other_running(record, keep, &at);
        }
    }
    if let Some(v) = &patch.updated_at {
        record.updated_at = v.clone();
    }
}

/// At most one step runs at a time: any other running step is closed out as
/// done before `keep` takes over.
fn close_other_running(record: &mut RunRecord, keep: StepName, timestamp: &str) {
    for s in record
        .steps
        .iter_mut()
        .filter(|s| s.status == StepStatus::Running && s.name != keep)
    {
        tracing::warn!(
            run_id = %record.run_id,
            closed = s.name.as_str(),
            starting = keep.as_str(),
            "step started while another was still running"
        );
        s.status = StepStatus::Success;
        s.completed_at = Some(timestamp.to_string());
    }
}

/// Render an event for the ephemeral display log, `[HH:MM:SS] message`.
/// Only `log` and `step_error` events produce a line.
pub fn display_line(event: &RunEvent) -> Option<String> {
    let message = match event {
        RunEvent::Log { message, .. } => message.clone(),
        RunEvent::StepError { step, message, .. } => format!("✗ {} failed: {message}", step.label()),
        _ => return None,
    };
    Some(format!("[{}] {message}", clock_time(event.timestamp())))
}

fn clock_time(timestamp: &str) -> String {
    let Ok(ts) = OffsetDateTime::parse(timestamp, &Rfc3339) else {
        return timestamp.to_string();
    };
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    ts.to_offset(offset)
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| timestamp.to_string())
}
