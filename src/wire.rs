//! Executor wire format.
//!
//! The executor speaks snake_case JSON; the local store keeps the camelCase
//! model. Everything crossing the HTTP boundary goes through these types.

use crate::model::{
    now_rfc3339, CoverageSummary, EdgeCaseCategories, PipelineStep, PrInfo, RunEvent, RunOptions,
    RunPatch, RunRecord, RunSpecification, RunStatus, StepName, StepStatus, TestRunOutput,
    TestStyle,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} event without a step name")]
    MissingStep(&'static str),
    #[error("unknown event type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOptions {
    pub max_iterations: u32,
    pub test_style: TestStyle,
    pub coverage_threshold: u8,
    pub edge_case_categories: EdgeCaseCategories,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl From<&RunOptions> for WireOptions {
    fn from(o: &RunOptions) -> Self {
        Self {
            max_iterations: o.max_iterations,
            test_style: o.test_style,
            coverage_threshold: o.coverage_threshold,
            edge_case_categories: o.edge_case_categories,
            create_pr: o.create_pr,
            repo_url: o.repo_url.clone(),
            branch: Some(o.branch.clone()),
        }
    }
}

impl From<WireOptions> for RunOptions {
    fn from(o: WireOptions) -> Self {
        Self {
            max_iterations: o.max_iterations,
            test_style: o.test_style,
            coverage_threshold: o.coverage_threshold,
            edge_case_categories: o.edge_case_categories,
            create_pr: o.create_pr,
            repo_url: o.repo_url,
            branch: o.branch.unwrap_or_else(|| "main".into()),
        }
    }
}

/// Body of `POST /runs`.
#[derive(Debug, Clone, Serialize)]
pub struct StartRunRequest {
    pub code: String,
    pub function_name: String,
    pub options: WireOptions,
}

impl From<&RunSpecification> for StartRunRequest {
    fn from(s: &RunSpecification) -> Self {
        Self {
            code: s.code.clone(),
            function_name: s.function_name.clone(),
            options: WireOptions::from(&s.options),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRunResponse {
    #[serde(rename = "runId", alias = "run_id")]
    pub run_id: String,
}

/// Error payload of a non-2xx response. FastAPI-style `detail` may be a string or a list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn best_message(&self) -> Option<String> {
        match &self.detail {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Null) | None => {}
            Some(other) => return Some(other.to_string()),
        }
        self.message.clone().filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStep {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<WireStep> for PipelineStep {
    fn from(s: WireStep) -> Self {
        Self {
            name: s.name,
            status: s.status,
            started_at: s.started_at,
            completed_at: s.completed_at,
            error: s.error,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireTestRunOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl From<WireTestRunOutput> for TestRunOutput {
    fn from(o: WireTestRunOutput) -> Self {
        Self {
            stdout: o.stdout,
            stderr: o.stderr,
            exit_code: o.exit_code,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePr {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl From<WirePr> for PrInfo {
    fn from(p: WirePr) -> Self {
        Self {
            title: p.title,
            body: p.body,
            url: p.url,
            changed_files: p.changed_files,
        }
    }
}

/// Full run document as returned by `GET /runs/{id}` and carried by `run_complete`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireRun {
    pub run_id: String,
    pub status: RunStatus,
    pub function_name: String,
    pub code: String,
    pub options: WireOptions,
    #[serde(default)]
    pub inferred_spec: String,
    #[serde(default)]
    pub edge_cases: Vec<String>,
    #[serde(default)]
    pub generated_tests: String,
    #[serde(default)]
    pub test_run_output: WireTestRunOutput,
    // Field names of the coverage summary are identical on both sides.
    #[serde(default)]
    pub coverage_summary: CoverageSummary,
    #[serde(default)]
    pub patch_diff: String,
    #[serde(default)]
    pub pr: Option<WirePr>,
    pub artifacts_path: String,
    #[serde(default)]
    pub iterations_used: u32,
    #[serde(default)]
    pub steps: Vec<WireStep>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<WireRun> for RunRecord {
    fn from(w: WireRun) -> Self {
        Self {
            run_id: w.run_id,
            status: w.status,
            spec: RunSpecification {
                code: w.code,
                function_name: w.function_name,
                options: w.options.into(),
            },
            inferred_spec: w.inferred_spec,
            edge_cases: w.edge_cases,
            generated_tests: w.generated_tests,
            test_run_output: w.test_run_output.into(),
            coverage_summary: w.coverage_summary,
            patch_diff: w.patch_diff,
            pr: w.pr.map(Into::into),
            artifacts_path: w.artifacts_path,
            iterations_used: w.iterations_used,
            steps: w.steps.into_iter().map(Into::into).collect(),
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

/// Partial run document carried by `step_complete`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WirePatch {
    pub status: Option<RunStatus>,
    pub inferred_spec: Option<String>,
    pub edge_cases: Option<Vec<String>>,
    pub generated_tests: Option<String>,
    pub test_run_output: Option<WireTestRunOutput>,
    pub coverage_summary: Option<CoverageSummary>,
    pub patch_diff: Option<String>,
    pub pr: Option<WirePr>,
    pub artifacts_path: Option<String>,
    pub iterations_used: Option<u32>,
    pub steps: Option<Vec<WireStep>>,
    pub updated_at: Option<String>,
}

impl From<WirePatch> for RunPatch {
    fn from(p: WirePatch) -> Self {
        Self {
            status: p.status,
            inferred_spec: p.inferred_spec,
            edge_cases: p.edge_cases,
            generated_tests: p.generated_tests,
            test_run_output: p.test_run_output.map(Into::into),
            coverage_summary: p.coverage_summary,
            patch_diff: p.patch_diff,
            pr: p.pr.map(Into::into),
            artifacts_path: p.artifacts_path,
            iterations_used: p.iterations_used,
            steps: p
                .steps
                .map(|steps| steps.into_iter().map(Into::into).collect()),
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    step: Option<StepName>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// A decoded stream message. `full_record` is set when a `run_complete`
/// carried a complete run document that can be persisted as-is.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub event: RunEvent,
    pub full_record: Option<RunRecord>,
}

/// Decode one server-push message body.
pub fn decode_event(raw: &str) -> Result<DecodedEvent, WireError> {
    let w: WireEvent = serde_json::from_str(raw)?;
    let timestamp = w.timestamp.unwrap_or_else(now_rfc3339);
    let mut full_record = None;

    let event = match w.kind.as_str() {
        "step_start" => RunEvent::StepStart {
            step: w.step.ok_or(WireError::MissingStep("step_start"))?,
            timestamp,
        },
        "step_complete" => RunEvent::StepComplete {
            step: w.step.ok_or(WireError::MissingStep("step_complete"))?,
            data: w.data.map(decode_patch).transpose()?.map(Box::new),
            timestamp,
        },
        "step_error" => RunEvent::StepError {
            step: w.step.ok_or(WireError::MissingStep("step_error"))?,
            message: w.message.unwrap_or_else(|| "step failed".into()),
            timestamp,
        },
        "log" => RunEvent::Log {
            message: w.message.unwrap_or_default(),
            timestamp,
        },
        "run_complete" => {
            let data = match w.data {
                Some(value) => match serde_json::from_value::<WireRun>(value.clone()) {
                    Ok(run) => {
                        let record = RunRecord::from(run);
                        let patch = RunPatch::from(&record);
                        full_record = Some(record);
                        Some(Box::new(patch))
                    }
                    Err(_) => Some(Box::new(decode_patch(value)?)),
                },
                None => None,
            };
            RunEvent::RunComplete { data, timestamp }
        }
        other => return Err(WireError::UnknownType(other.to_string())),
    };
    Ok(DecodedEvent { event, full_record })
}

fn decode_patch(value: serde_json::Value) -> Result<RunPatch, WireError> {
    Ok(serde_json::from_value::<WirePatch>(value)?.into())
}
