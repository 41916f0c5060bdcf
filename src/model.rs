use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time as an RFC 3339 string, the timestamp format used by records and events.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum TestStyle {
    #[serde(rename = "unit")]
    Unit,
    #[serde(rename = "property-based")]
    PropertyBased,
}

impl TestStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStyle::Unit => "unit",
            TestStyle::PropertyBased => "property-based",
        }
    }
}

/// Edge-case categories the generator is asked to cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCaseCategories {
    pub none: bool,
    pub empty: bool,
    pub large: bool,
    pub unicode: bool,
    pub floats: bool,
    pub timezones: bool,
}

impl Default for EdgeCaseCategories {
    fn default() -> Self {
        Self {
            none: false,
            empty: true,
            large: true,
            unicode: false,
            floats: false,
            timezones: false,
        }
    }
}

impl EdgeCaseCategories {
    pub const NAMES: [&'static str; 6] = ["none", "empty", "large", "unicode", "floats", "timezones"];

    /// Build from a list of category names; every name not listed is off.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mut cats = Self {
            none: false,
            empty: false,
            large: false,
            unicode: false,
            floats: false,
            timezones: false,
        };
        for name in names {
            match name.trim() {
                "none" => cats.none = true,
                "empty" => cats.empty = true,
                "large" => cats.large = true,
                "unicode" => cats.unicode = true,
                "floats" => cats.floats = true,
                "timezones" => cats.timezones = true,
                "" => {}
                other => {
                    return Err(format!(
                        "unknown edge-case category '{other}' (expected one of {})",
                        Self::NAMES.join(", ")
                    ))
                }
            }
        }
        Ok(cats)
    }

    /// Names of the enabled categories, in declaration order.
    pub fn enabled(&self) -> Vec<&'static str> {
        let flags = [
            self.none,
            self.empty,
            self.large,
            self.unicode,
            self.floats,
            self.timezones,
        ];
        Self::NAMES
            .iter()
            .zip(flags)
            .filter_map(|(name, on)| on.then_some(*name))
            .collect()
    }
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub max_iterations: u32,
    pub test_style: TestStyle,
    pub coverage_threshold: u8,
    pub edge_case_categories: EdgeCaseCategories,
    #[serde(rename = "createPR", default)]
    pub create_pr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            test_style: TestStyle::Unit,
            coverage_threshold: 80,
            edge_case_categories: EdgeCaseCategories::default(),
            create_pr: false,
            repo_url: None,
            branch: default_branch(),
        }
    }
}

/// What the user submitted: source text, the symbol to test, and the run options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpecification {
    pub code: String,
    pub function_name: String,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    ReadCode,
    InferBehavior,
    GenerateTests,
    RunTests,
    FixTests,
    CoverageReport,
    PrReadyOutput,
    OpenPr,
}

impl StepName {
    /// Steps every run goes through, in order. `OpenPr` is appended when a PR was requested.
    pub const BASE_PIPELINE: [StepName; 7] = [
        StepName::ReadCode,
        StepName::InferBehavior,
        StepName::GenerateTests,
        StepName::RunTests,
        StepName::FixTests,
        StepName::CoverageReport,
        StepName::PrReadyOutput,
    ];

    pub fn pipeline(create_pr: bool) -> Vec<StepName> {
        let mut steps = Self::BASE_PIPELINE.to_vec();
        if create_pr {
            steps.push(StepName::OpenPr);
        }
        steps
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::ReadCode => "read_code",
            StepName::InferBehavior => "infer_behavior",
            StepName::GenerateTests => "generate_tests",
            StepName::RunTests => "run_tests",
            StepName::FixTests => "fix_tests",
            StepName::CoverageReport => "coverage_report",
            StepName::PrReadyOutput => "pr_ready_output",
            StepName::OpenPr => "open_pr",
        }
    }

    /// Human form, e.g. `coverage report`.
    pub fn label(self) -> String {
        self.as_str().replace('_', " ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Success,
    Fail,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Fail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineStep {
    pub fn queued(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageFile {
    pub filename: String,
    pub percent: f64,
    pub lines: u32,
    pub branches: u32,
}

/// Aggregate coverage percentages plus a per-file breakdown. All zero until `coverage_report` completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub lines: f64,
    pub branches: f64,
    pub functions: f64,
    pub files: Vec<CoverageFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrInfo {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub changed_files: Vec<String>,
}

/// Durable record of one run, persisted after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(flatten)]
    pub spec: RunSpecification,
    pub inferred_spec: String,
    pub edge_cases: Vec<String>,
    pub generated_tests: String,
    pub test_run_output: TestRunOutput,
    pub coverage_summary: CoverageSummary,
    pub patch_diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    pub artifacts_path: String,
    pub iterations_used: u32,
    pub steps: Vec<PipelineStep>,
    pub created_at: String,
    pub updated_at: String,
}

impl RunRecord {
    /// Fresh record for a just-submitted specification: status queued, every step queued.
    pub fn queued(run_id: String, spec: RunSpecification) -> Self {
        let now = now_rfc3339();
        let steps = StepName::pipeline(spec.options.create_pr)
            .into_iter()
            .map(PipelineStep::queued)
            .collect();
        Self {
            artifacts_path: artifacts_path_for(&run_id),
            run_id,
            status: RunStatus::Queued,
            spec,
            inferred_spec: String::new(),
            edge_cases: Vec::new(),
            generated_tests: String::new(),
            test_run_output: TestRunOutput::default(),
            coverage_summary: CoverageSummary::default(),
            patch_diff: String::new(),
            pr: None,
            iterations_used: 0,
            steps,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn step(&self, name: StepName) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn running_step(&self) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }
}

/// Where a run's generated files live, relative to the executor's working tree.
pub fn artifacts_path_for(run_id: &str) -> String {
    format!("experiments/{run_id}")
}

/// Partial record carried by `step_complete` and `run_complete` events.
///
/// Only the fields a pipeline produces are present; identity fields (id, code,
/// options, creation time) never change after submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_cases: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_tests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_output: Option<TestRunOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_summary: Option<CoverageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<PipelineStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<&RunRecord> for RunPatch {
    fn from(r: &RunRecord) -> Self {
        Self {
            status: Some(r.status),
            inferred_spec: Some(r.inferred_spec.clone()),
            edge_cases: Some(r.edge_cases.clone()),
            generated_tests: Some(r.generated_tests.clone()),
            test_run_output: Some(r.test_run_output.clone()),
            coverage_summary: Some(r.coverage_summary.clone()),
            patch_diff: Some(r.patch_diff.clone()),
            pr: r.pr.clone(),
            artifacts_path: Some(r.artifacts_path.clone()),
            iterations_used: Some(r.iterations_used),
            steps: Some(r.steps.clone()),
            updated_at: Some(r.updated_at.clone()),
        }
    }
}

/// Lifecycle events produced by a driver, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    StepStart {
        step: StepName,
        timestamp: String,
    },
    StepComplete {
        step: StepName,
        // Box to keep RunEvent small; the patch can carry the whole record.
        data: Option<Box<RunPatch>>,
        timestamp: String,
    },
    StepError {
        step: StepName,
        message: String,
        timestamp: String,
    },
    Log {
        message: String,
        timestamp: String,
    },
    RunComplete {
        data: Option<Box<RunPatch>>,
        timestamp: String,
    },
}

impl RunEvent {
    pub fn log(message: impl Into<String>) -> Self {
        RunEvent::Log {
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            RunEvent::StepStart { timestamp, .. }
            | RunEvent::StepComplete { timestamp, .. }
            | RunEvent::StepError { timestamp, .. }
            | RunEvent::Log { timestamp, .. }
            | RunEvent::RunComplete { timestamp, .. } => timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::StepStart { .. } => "step_start",
            RunEvent::StepComplete { .. } => "step_complete",
            RunEvent::StepError { .. } => "step_error",
            RunEvent::Log { .. } => "log",
            RunEvent::RunComplete { .. } => "run_complete",
        }
    }
}
