//! Run lifecycle controller.
//!
//! Owns the active run: creates records, attaches a driver, folds each event
//! through the reconciler into the store, and handles cancellation.

use crate::driver::{DriverHandle, RunDriver, TransportError};
use crate::model::{now_rfc3339, RunEvent, RunRecord, RunSpecification, RunStatus, StepStatus};
use crate::reconcile;
use crate::store::RunStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Rejections raised before any record exists.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Please provide Python code to test")]
    EmptyCode,
    #[error("Please select a function or class to test")]
    MissingSymbol,
    #[error("max iterations must be at least 1")]
    InvalidIterations,
    #[error("coverage threshold must be between 0 and 100, got {0}")]
    InvalidThreshold(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Run {0} not found")]
    NotFound(String),
    #[error("no run is loaded")]
    NoActiveRun,
    #[error("run {0} is already streaming in this session")]
    Busy(String),
}

/// Driver task attached to the current run.
struct ActiveRun {
    run_id: String,
    handle: DriverHandle,
    events: UnboundedReceiver<RunEvent>,
}

pub struct RunController {
    store: RunStore,
    driver: Arc<dyn RunDriver>,
    current: Option<RunRecord>,
    log: Vec<String>,
    active: Option<ActiveRun>,
}

impl RunController {
    pub fn new(store: RunStore, driver: Arc<dyn RunDriver>) -> Self {
        Self {
            store,
            driver,
            current: None,
            log: Vec::new(),
            active: None,
        }
    }

    /// Validate, register and persist a new run, then start streaming it.
    pub async fn submit(&mut self, spec: RunSpecification) -> Result<RunRecord, SubmitError> {
        validate(&spec)?;
        if let Some(active) = &self.active {
            tracing::warn!(run_id = %active.run_id, "detaching previous run for a new submission");
            self.detach().await;
        }

        let run_id = self.driver.submit(&spec).await?;
        tracing::info!(%run_id, driver = self.driver.name(), "run submitted");
        let record = RunRecord::queued(run_id, spec);
        self.store.save(&record);
        self.log.clear();
        self.current = Some(record.clone());
        self.attach(&record);
        Ok(record)
    }

    /// Load a run without attaching a driver.
    pub async fn open(&mut self, run_id: &str) -> Result<&RunRecord, ControllerError> {
        if self.active.as_ref().is_some_and(|a| a.run_id != run_id) {
            return Err(ControllerError::Busy(self.active_run_id()));
        }
        let record = self
            .driver
            .fetch(run_id)
            .await
            .ok_or_else(|| ControllerError::NotFound(run_id.to_string()))?;
        if self.current.as_ref().map(|r| r.run_id.as_str()) != Some(run_id) {
            self.log.clear();
        }
        Ok(self.current.insert(record))
    }

    /// Load a run and reattach a driver if it has not finished.
    ///
    /// Activating the run that is already attached is a no-op.
    pub async fn activate(&mut self, run_id: &str) -> Result<&RunRecord, ControllerError> {
        if self.active.as_ref().is_some_and(|a| a.run_id == run_id) {
            tracing::debug!(run_id, "already attached");
            return self.current.as_ref().ok_or(ControllerError::NoActiveRun);
        }
        self.open(run_id).await?;
        let record = self.current.clone().ok_or(ControllerError::NoActiveRun)?;
        if matches!(record.status, RunStatus::Queued | RunStatus::Running) {
            tracing::info!(run_id, status = record.status.as_str(), "reattaching driver");
            self.attach(&record);
        }
        self.current.as_ref().ok_or(ControllerError::NoActiveRun)
    }

    fn attach(&mut self, record: &RunRecord) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.driver.start(&record.run_id, &record.spec, tx);
        self.active = Some(ActiveRun {
            run_id: record.run_id.clone(),
            handle,
            events: rx,
        });
    }

    async fn detach(&mut self) {
        if let Some(active) = self.active.take() {
            drop(active.events);
            active.handle.join().await;
        }
    }

    /// Wait for the next driver event and fold it into the current record.
    ///
    /// Returns `None` once the driver has nothing more to say, or once the run
    /// was finished from outside this controller (e.g. `cancel` in another process).
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        let active = self.active.as_mut()?;
        let Some(event) = active.events.recv().await else {
            tracing::debug!(run_id = %active.run_id, "driver channel closed");
            self.detach().await;
            return None;
        };
        let run_id = active.run_id.clone();

        let record = match self.current.take() {
            Some(r) => r,
            None => self.store.get(&run_id)?,
        };
        let was_finished = record.status.is_terminal();
        let record = reconcile::apply(record, &event);
        match self.store.save_unless_finished(&record) {
            None => self.current = Some(record),
            Some(stored) if was_finished => self.current = Some(stored),
            Some(stored) => return self.adopt_finished(stored, event).await,
        }
        if let Some(line) = reconcile::display_line(&event) {
            self.log.push(line);
        }

        if matches!(event, RunEvent::RunComplete { .. }) {
            self.detach().await;
        }
        Some(event)
    }

    /// The stored record finished while this controller still had it running.
    ///
    /// On `run_complete` that is the executor's final document saved by the
    /// stream. Anything else means the run ended elsewhere, so the driver stops.
    async fn adopt_finished(&mut self, stored: RunRecord, event: RunEvent) -> Option<RunEvent> {
        let completed = matches!(event, RunEvent::RunComplete { .. });
        if let Some(active) = self.active.take() {
            if !completed {
                tracing::info!(
                    run_id = %active.run_id,
                    status = stored.status.as_str(),
                    "run finished elsewhere, stopping driver"
                );
                active.handle.cancel();
            }
            drop(active.events);
            active.handle.join().await;
        }
        let status = stored.status;
        self.current = Some(stored);
        if completed {
            return Some(event);
        }
        let notice = RunEvent::log(format!("Run {} in another session", status.as_str()));
        if let Some(line) = reconcile::display_line(&notice) {
            self.log.push(line);
        }
        None
    }

    /// Drain events until the driver finishes.
    pub async fn run_to_end(&mut self) -> Option<&RunRecord> {
        while self.next_event().await.is_some() {}
        self.current.as_ref()
    }

    /// Stop the current run locally and ask the executor to stop it too.
    ///
    /// The persisted record ends up `cancelled` unless it already finished. The
    /// local record is settled before the executor is contacted, and that request
    /// is time-bounded by the driver.
    pub async fn cancel(&mut self) -> Result<RunRecord, ControllerError> {
        let run_id = match (&self.active, &self.current) {
            (Some(active), _) => active.run_id.clone(),
            (None, Some(record)) => record.run_id.clone(),
            (None, None) => return Err(ControllerError::NoActiveRun),
        };

        // An attached driver notifies the executor itself when it stops.
        let attached = self.active.take();
        let notify_executor = attached.is_none();
        if let Some(active) = attached {
            active.handle.cancel();
            drop(active.events);
            active.handle.join().await;
        }

        let record = self.settle_cancelled(&run_id)?;
        if notify_executor {
            if let Err(e) = self.driver.cancel_remote(&run_id).await {
                tracing::warn!(%run_id, "remote cancel failed: {e}");
            }
        }
        Ok(record)
    }

    fn settle_cancelled(&mut self, run_id: &str) -> Result<RunRecord, ControllerError> {
        let mut record = self
            .store
            .get(run_id)
            .or_else(|| self.current.take())
            .ok_or_else(|| ControllerError::NotFound(run_id.to_string()))?;
        if !record.status.is_terminal() {
            if let Some(step) = record
                .steps
                .iter_mut()
                .find(|s| s.status == StepStatus::Running)
            {
                step.status = StepStatus::Fail;
                step.error = Some("cancelled".into());
                step.completed_at = Some(now_rfc3339());
            }
            record.status = RunStatus::Cancelled;
            record.updated_at = now_rfc3339();
            match self.store.save_unless_finished(&record) {
                Some(stored) => record = stored,
                None => {
                    tracing::info!(run_id, "run cancelled");
                    if let Some(line) = reconcile::display_line(&RunEvent::log("Run cancelled")) {
                        self.log.push(line);
                    }
                }
            }
        }
        self.current = Some(record.clone());
        Ok(record)
    }

    pub fn current(&self) -> Option<&RunRecord> {
        self.current.as_ref()
    }

    /// Display lines collected since the run was loaded. Never persisted.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    fn active_run_id(&self) -> String {
        self.active
            .as_ref()
            .map(|a| a.run_id.clone())
            .unwrap_or_default()
    }
}

fn validate(spec: &RunSpecification) -> Result<(), SubmitError> {
    if spec.code.trim().is_empty() {
        return Err(SubmitError::EmptyCode);
    }
    if spec.function_name.trim().is_empty() {
        return Err(SubmitError::MissingSymbol);
    }
    if spec.options.max_iterations == 0 {
        return Err(SubmitError::InvalidIterations);
    }
    if spec.options.coverage_threshold > 100 {
        return Err(SubmitError::InvalidThreshold(spec.options.coverage_threshold));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_executor::{json_response, spawn_executor, sse_head, Reply};
    use crate::driver::{ExecutorClient, RemoteDriver, SimulatedDriver, SimulationTiming};
    use crate::model::{RunOptions, StepName, TestStyle};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast() -> SimulationTiming {
        SimulationTiming {
            step_min: Duration::from_millis(1),
            step_max: Duration::from_millis(3),
            pacing: Duration::from_millis(1),
        }
    }

    fn controller(timing: SimulationTiming) -> (tempfile::TempDir, RunStore, RunController) {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let driver = Arc::new(SimulatedDriver::new(store.clone(), timing));
        let ctl = RunController::new(store.clone(), driver);
        (dir, store, ctl)
    }

    fn spec(options: RunOptions) -> RunSpecification {
        RunSpecification {
            code: "def add(a, b):\n    return a + b\n".into(),
            function_name: "add".into(),
            options,
        }
    }

    #[tokio::test]
    async fn full_simulated_run_succeeds() {
        let (_dir, store, mut ctl) = controller(fast());
        let options = RunOptions {
            test_style: TestStyle::Unit,
            create_pr: false,
            ..RunOptions::default()
        };
        let queued = ctl.submit(spec(options)).await.unwrap();
        assert_eq!(queued.status, RunStatus::Queued);
        assert!(ctl.is_streaming());

        ctl.run_to_end().await;
        assert!(!ctl.is_streaming());

        let saved = store.get(&queued.run_id).unwrap();
        assert_eq!(saved.status, RunStatus::Success);
        assert_eq!(saved.steps.len(), 7);
        assert!(saved.steps.iter().all(|s| s.status == StepStatus::Success));
        assert!(saved.generated_tests.contains("def test_add"));
        assert!(saved.coverage_summary.lines > 0.0);
        assert_eq!(ctl.current(), Some(&saved));
        assert!(!ctl.log().is_empty());
    }

    #[tokio::test]
    async fn pr_run_adds_open_pr_with_one_changed_file() {
        let (_dir, store, mut ctl) = controller(fast());
        let options = RunOptions {
            create_pr: true,
            repo_url: Some("https://github.com/acme/calc".into()),
            ..RunOptions::default()
        };
        let queued = ctl.submit(spec(options)).await.unwrap();
        ctl.run_to_end().await;

        let saved = store.get(&queued.run_id).unwrap();
        assert_eq!(saved.status, RunStatus::Success);
        assert_eq!(saved.steps.len(), 8);
        assert_eq!(saved.steps[7].name, StepName::OpenPr);
        assert_eq!(saved.steps[7].status, StepStatus::Success);
        let pr = saved.pr.expect("pr info");
        assert_eq!(pr.changed_files.len(), 1);
        assert!(pr.changed_files[0].starts_with(&format!("{}/", saved.artifacts_path)));
    }

    #[tokio::test]
    async fn cancel_after_first_step_leaves_rest_queued() {
        let timing = SimulationTiming {
            pacing: Duration::from_secs(30),
            ..fast()
        };
        let (_dir, store, mut ctl) = controller(timing);
        let options = RunOptions {
            max_iterations: 3,
            ..RunOptions::default()
        };
        let queued = ctl.submit(spec(options)).await.unwrap();

        let mut saw_run_complete = false;
        loop {
            match ctl.next_event().await {
                Some(RunEvent::StepComplete { .. }) => break,
                Some(RunEvent::RunComplete { .. }) => saw_run_complete = true,
                Some(_) => {}
                None => panic!("driver ended before the first step completed"),
            }
        }
        let cancelled = ctl.cancel().await.unwrap();
        assert!(!saw_run_complete);
        assert!(!ctl.is_streaming());
        assert!(ctl.next_event().await.is_none());

        let saved = store.get(&queued.run_id).unwrap();
        assert_eq!(saved, cancelled);
        assert_eq!(saved.status, RunStatus::Cancelled);
        assert_eq!(saved.steps[0].status, StepStatus::Success);
        assert!(saved.steps[1..].iter().all(|s| s.status == StepStatus::Queued));
        assert!(ctl.log().last().unwrap().ends_with("Run cancelled"));
    }

    #[tokio::test]
    async fn cancel_mid_step_fails_that_step() {
        let timing = SimulationTiming {
            step_min: Duration::from_secs(30),
            step_max: Duration::from_secs(30),
            pacing: Duration::from_millis(1),
        };
        let (_dir, store, mut ctl) = controller(timing);
        let queued = ctl.submit(spec(RunOptions::default())).await.unwrap();
        assert!(matches!(ctl.next_event().await, Some(RunEvent::StepStart { .. })));

        ctl.cancel().await.unwrap();
        let saved = store.get(&queued.run_id).unwrap();
        assert_eq!(saved.status, RunStatus::Cancelled);
        assert_eq!(saved.steps[0].status, StepStatus::Fail);
        assert_eq!(saved.steps[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn rejects_incomplete_specification_without_touching_store() {
        let (_dir, store, mut ctl) = controller(fast());
        let mut empty = spec(RunOptions::default());
        empty.code = "   ".into();
        empty.function_name = String::new();
        assert!(matches!(ctl.submit(empty).await, Err(SubmitError::EmptyCode)));

        let mut no_symbol = spec(RunOptions::default());
        no_symbol.function_name = String::new();
        assert!(matches!(ctl.submit(no_symbol).await, Err(SubmitError::MissingSymbol)));

        let bad_threshold = spec(RunOptions {
            coverage_threshold: 101,
            ..RunOptions::default()
        });
        assert!(matches!(
            ctl.submit(bad_threshold).await,
            Err(SubmitError::InvalidThreshold(101))
        ));

        assert!(store.is_empty());
        assert!(ctl.current().is_none());
        assert!(!ctl.is_streaming());
    }

    #[tokio::test]
    async fn activate_resumes_unfinished_run_once() {
        let (_dir, store, mut ctl) = controller(fast());
        let record = RunRecord::queued("run_resume".into(), spec(RunOptions::default()));
        store.save(&record);

        ctl.activate("run_resume").await.unwrap();
        assert!(ctl.is_streaming());
        ctl.activate("run_resume").await.unwrap();
        assert!(ctl.is_streaming());

        let mut completions = 0;
        while let Some(ev) = ctl.next_event().await {
            if matches!(ev, RunEvent::RunComplete { .. }) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(store.get("run_resume").unwrap().status, RunStatus::Success);
    }

    #[tokio::test]
    async fn activate_does_not_attach_finished_runs() {
        let (_dir, store, mut ctl) = controller(fast());
        let mut record = RunRecord::queued("run_done".into(), spec(RunOptions::default()));
        record.status = RunStatus::Success;
        store.save(&record);

        let loaded = ctl.activate("run_done").await.unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert!(!ctl.is_streaming());
    }

    #[tokio::test]
    async fn activate_unknown_run_is_not_found() {
        let (_dir, _store, mut ctl) = controller(fast());
        assert!(matches!(
            ctl.activate("run_missing").await,
            Err(ControllerError::NotFound(id)) if id == "run_missing"
        ));
    }

    #[tokio::test]
    async fn cancel_detached_run_marks_record_cancelled() {
        let (_dir, store, mut ctl) = controller(fast());
        let mut record = RunRecord::queued("run_elsewhere".into(), spec(RunOptions::default()));
        record.status = RunStatus::Running;
        record.steps[0].status = StepStatus::Running;
        store.save(&record);

        ctl.open("run_elsewhere").await.unwrap();
        let cancelled = ctl.cancel().await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.steps[0].status, StepStatus::Fail);
    }

    #[tokio::test]
    async fn cancel_without_a_run_is_an_error() {
        let (_dir, _store, mut ctl) = controller(fast());
        assert!(matches!(ctl.cancel().await, Err(ControllerError::NoActiveRun)));
    }

    #[tokio::test]
    async fn cancel_from_another_session_stops_the_streaming_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let session = |store: RunStore| {
            let driver = Arc::new(SimulatedDriver::new(store.clone(), fast()));
            RunController::new(store, driver)
        };
        let mut streaming = session(RunStore::open(&path));
        let queued = streaming.submit(spec(RunOptions::default())).await.unwrap();
        loop {
            match streaming.next_event().await {
                Some(RunEvent::StepComplete { .. }) => break,
                Some(_) => {}
                None => panic!("driver ended before the first step completed"),
            }
        }

        let mut other = session(RunStore::open(&path));
        other.open(&queued.run_id).await.unwrap();
        assert_eq!(other.cancel().await.unwrap().status, RunStatus::Cancelled);

        let mut late = Vec::new();
        while let Some(ev) = streaming.next_event().await {
            late.push(ev);
        }
        assert!(late.is_empty(), "events applied after cancel: {late:?}");
        assert!(!streaming.is_streaming());
        assert_eq!(streaming.current().unwrap().status, RunStatus::Cancelled);
        assert!(streaming
            .log()
            .last()
            .unwrap()
            .ends_with("Run cancelled in another session"));

        let saved = RunStore::open(&path).get(&queued.run_id).unwrap();
        assert_eq!(saved.status, RunStatus::Cancelled);
        assert_eq!(saved.steps[0].status, StepStatus::Success);
    }

    fn remote_controller(base: &str) -> (tempfile::TempDir, RunStore, RunController) {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let client = ExecutorClient::new(base)
            .unwrap()
            .with_request_timeout(Duration::from_millis(100));
        let driver = RemoteDriver::new(client, store.clone()).with_retry_delay(Duration::from_millis(5));
        let ctl = RunController::new(store.clone(), Arc::new(driver));
        (dir, store, ctl)
    }

    #[tokio::test]
    async fn silent_executor_does_not_block_a_detached_cancel() {
        let (base, _) = spawn_executor(|_| Reply::Silent).await;
        let (_dir, store, mut ctl) = remote_controller(&base);
        let mut record = RunRecord::queued("run_h".into(), spec(RunOptions::default()));
        record.status = RunStatus::Running;
        record.steps[0].status = StepStatus::Running;
        store.save(&record);

        let cancelled = tokio::time::timeout(Duration::from_secs(3), async {
            ctl.open("run_h").await.unwrap();
            ctl.cancel().await.unwrap()
        })
        .await
        .expect("cancel should not wait on the executor");
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(store.get("run_h").unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn remote_step_error_persists_failed_run() {
        let body = format!(
            "{}data: {}\n\ndata: {}\n\ndata: {}\n\n",
            sse_head(),
            json!({"type": "step_start", "step": "read_code", "timestamp": "2026-01-01T00:00:01Z"}),
            json!({"type": "step_error", "step": "read_code",
                   "message": "SyntaxError: invalid syntax", "timestamp": "2026-01-01T00:00:02Z"}),
            json!({"type": "run_complete", "timestamp": "2026-01-01T00:00:03Z"}),
        );
        let (base, _) = spawn_executor(move |req| {
            if req.starts_with("POST /api/runs\n") {
                json_response("200 OK", r#"{"runId":"run_r"}"#)
            } else {
                Reply::Respond(body.clone())
            }
        })
        .await;
        let (_dir, store, mut ctl) = remote_controller(&base);

        ctl.submit(spec(RunOptions::default())).await.unwrap();
        ctl.run_to_end().await;
        assert!(!ctl.is_streaming());

        let saved = store.get("run_r").unwrap();
        assert_eq!(saved.status, RunStatus::Failed);
        assert_eq!(saved.steps[0].status, StepStatus::Fail);
        assert_eq!(saved.steps[0].error.as_deref(), Some("SyntaxError: invalid syntax"));
        assert!(saved.steps[1..].iter().all(|s| s.status == StepStatus::Queued));
        assert!(ctl
            .log()
            .iter()
            .any(|l| l.ends_with("failed: SyntaxError: invalid syntax")));
    }

    #[tokio::test]
    async fn attached_remote_cancel_survives_executor_error() {
        let first = json!({"type": "step_start", "step": "read_code", "timestamp": "t"});
        let (base, requests) = spawn_executor(move |req| {
            if req.starts_with("POST /api/runs/run_c/cancel") {
                json_response("500 Internal Server Error", "{}")
            } else if req.starts_with("POST ") {
                json_response("200 OK", r#"{"runId":"run_c"}"#)
            } else {
                Reply::Hold(format!("{}data: {first}\n\n", sse_head()))
            }
        })
        .await;
        let (_dir, store, mut ctl) = remote_controller(&base);

        ctl.submit(spec(RunOptions::default())).await.unwrap();
        assert!(matches!(ctl.next_event().await, Some(RunEvent::StepStart { .. })));
        let cancelled = tokio::time::timeout(Duration::from_secs(5), ctl.cancel())
            .await
            .expect("cancel should be bounded")
            .unwrap();

        assert_eq!(cancelled.status, RunStatus::Cancelled);
        let saved = store.get("run_c").unwrap();
        assert_eq!(saved.status, RunStatus::Cancelled);
        assert_eq!(saved.steps[0].status, StepStatus::Fail);
        assert_eq!(saved.steps[0].error.as_deref(), Some("cancelled"));
        assert!(requests
            .lock()
            .iter()
            .any(|r| r.starts_with("POST /api/runs/run_c/cancel")));
    }
}
