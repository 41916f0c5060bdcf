use super::{cancel_requested, new_run_id, synth, DriverControl, DriverHandle, RunDriver, TransportError};
use crate::model::{
    now_rfc3339, RunEvent, RunPatch, RunRecord, RunSpecification, RunStatus, StepName, StepStatus,
};
use crate::store::RunStore;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delays of the simulated pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SimulationTiming {
    /// Per-step latency is drawn uniformly from `step_min..=step_max`.
    pub step_min: Duration,
    pub step_max: Duration,
    /// Pause between a step completing and the next one starting.
    pub pacing: Duration,
}

impl Default for SimulationTiming {
    fn default() -> Self {
        Self {
            step_min: Duration::from_millis(1000),
            step_max: Duration::from_millis(3000),
            pacing: Duration::from_millis(500),
        }
    }
}

impl SimulationTiming {
    fn step_latency(&self) -> Duration {
        if self.step_max <= self.step_min {
            return self.step_min;
        }
        let min = self.step_min.as_millis() as u64;
        let max = self.step_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Runs the pipeline locally with synthetic outputs, no executor involved.
///
/// Resumes from the persisted record: steps already `success` are not replayed.
pub struct SimulatedDriver {
    store: RunStore,
    timing: SimulationTiming,
}

impl SimulatedDriver {
    pub fn new(store: RunStore, timing: SimulationTiming) -> Self {
        Self { store, timing }
    }
}

#[async_trait]
impl RunDriver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn submit(&self, _spec: &RunSpecification) -> Result<String, TransportError> {
        Ok(new_run_id())
    }

    async fn fetch(&self, run_id: &str) -> Option<RunRecord> {
        self.store.get(run_id)
    }

    fn start(
        &self,
        run_id: &str,
        spec: &RunSpecification,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> DriverHandle {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<DriverControl>();
        let pipeline = Pipeline {
            run_id: run_id.to_string(),
            spec: spec.clone(),
            store: self.store.clone(),
            timing: self.timing,
            events,
            ctrl_rx,
        };
        let handle = tokio::spawn(pipeline.run());
        DriverHandle::new(ctrl_tx, handle)
    }

    async fn cancel_remote(&self, _run_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Why the step loop stopped early.
enum Stop {
    Cancelled,
    ReceiverGone,
}

struct Pipeline {
    run_id: String,
    spec: RunSpecification,
    store: RunStore,
    timing: SimulationTiming,
    events: mpsc::UnboundedSender<RunEvent>,
    ctrl_rx: mpsc::UnboundedReceiver<DriverControl>,
}

impl Pipeline {
    async fn run(mut self) {
        let Some(mut run) = self.store.get(&self.run_id) else {
            tracing::warn!(run_id = %self.run_id, "simulated run has no stored record");
            let _ = self
                .events
                .send(RunEvent::log(format!("Run {} not found in local store", self.run_id)));
            return;
        };

        match self.steps(&mut run).await {
            Ok(()) => {
                run.status = RunStatus::Success;
                run.updated_at = now_rfc3339();
                tracing::info!(run_id = %self.run_id, "simulated run complete");
                let _ = self.events.send(RunEvent::RunComplete {
                    data: Some(Box::new(RunPatch::from(&run))),
                    timestamp: now_rfc3339(),
                });
            }
            Err(Stop::Cancelled) => {
                tracing::info!(run_id = %self.run_id, "simulated run cancelled");
            }
            Err(Stop::ReceiverGone) => {
                tracing::debug!(run_id = %self.run_id, "event receiver dropped, stopping simulation");
            }
        }
    }

    async fn steps(&mut self, run: &mut RunRecord) -> Result<(), Stop> {
        for step in StepName::pipeline(self.spec.options.create_pr) {
            if run.step(step).is_some_and(|s| s.status == StepStatus::Success) {
                tracing::debug!(step = step.as_str(), "step already complete, skipping");
                continue;
            }

            let started = now_rfc3339();
            run.status = RunStatus::Running;
            if let Some(s) = run.step_mut(step) {
                s.status = StepStatus::Running;
                s.started_at = Some(started.clone());
                s.completed_at = None;
                s.error = None;
            }
            self.emit(RunEvent::StepStart {
                step,
                timestamp: started,
            })?;
            self.emit(RunEvent::log(format!("Starting {}...", step.label())))?;

            self.pause(self.timing.step_latency()).await?;

            let note = self.synthesize(run, step);
            self.emit(RunEvent::log(note))?;

            let completed = now_rfc3339();
            if let Some(s) = run.step_mut(step) {
                s.status = StepStatus::Success;
                s.completed_at = Some(completed.clone());
            }
            run.updated_at = completed.clone();
            self.emit(RunEvent::StepComplete {
                step,
                data: Some(Box::new(RunPatch::from(&*run))),
                timestamp: completed,
            })?;

            self.pause(self.timing.pacing).await?;
        }
        Ok(())
    }

    /// Fill in the step's outputs; returns the result line for the log.
    fn synthesize(&self, run: &mut RunRecord, step: StepName) -> String {
        let symbol = self.spec.function_name.as_str();
        let options = &self.spec.options;
        match step {
            StepName::ReadCode => "✓ Code parsed successfully".into(),
            StepName::InferBehavior => {
                run.inferred_spec = synth::inferred_spec(symbol);
                run.edge_cases = synth::edge_cases(&options.edge_case_categories);
                "✓ Behavior inferred: mathematical operation".into()
            }
            StepName::GenerateTests => {
                run.generated_tests = synth::generated_tests(symbol, options.test_style);
                "✓ Generated test suite".into()
            }
            StepName::RunTests => {
                run.test_run_output = synth::test_run_output();
                "✓ All tests passed".into()
            }
            StepName::FixTests => {
                run.iterations_used = run.iterations_used.max(1).min(options.max_iterations);
                "✓ Tests validated, no fixes needed".into()
            }
            StepName::CoverageReport => {
                run.coverage_summary = synth::coverage();
                format!(
                    "✓ Coverage: {}% lines, {}% branches",
                    run.coverage_summary.lines, run.coverage_summary.branches
                )
            }
            StepName::PrReadyOutput => {
                let path = synth::test_file_path(&run.artifacts_path, symbol);
                run.patch_diff = synth::patch_diff(&path, &run.generated_tests);
                format!("✓ Output written to {}/", run.artifacts_path)
            }
            StepName::OpenPr => {
                run.pr = Some(synth::pr_info(
                    symbol,
                    options,
                    &run.coverage_summary,
                    &run.generated_tests,
                    &run.artifacts_path,
                ));
                if options.repo_url.is_some() {
                    "⚠ Mock mode: PR creation simulated (no real PR created)".into()
                } else {
                    "⚠ PR creation skipped: Repository URL not provided".into()
                }
            }
        }
    }

    fn emit(&self, event: RunEvent) -> Result<(), Stop> {
        self.events.send(event).map_err(|_| Stop::ReceiverGone)
    }

    /// Sleep unless a cancel arrives first.
    async fn pause(&mut self, d: Duration) -> Result<(), Stop> {
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            _ = cancel_requested(&mut self.ctrl_rx) => Err(Stop::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunOptions;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn fast() -> SimulationTiming {
        SimulationTiming {
            step_min: Duration::from_millis(1),
            step_max: Duration::from_millis(3),
            pacing: Duration::from_millis(1),
        }
    }

    fn spec(create_pr: bool) -> RunSpecification {
        RunSpecification {
            code: "def add(a, b):\n    return a + b\n".into(),
            function_name: "add".into(),
            options: RunOptions {
                create_pr,
                repo_url: create_pr.then(|| "https://github.com/acme/calc".to_string()),
                ..RunOptions::default()
            },
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn emits_ordered_lifecycle_and_one_run_complete() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let record = RunRecord::queued("run_sim".into(), spec(false));
        store.save(&record);

        let driver = SimulatedDriver::new(store.clone(), fast());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = driver.start("run_sim", &record.spec, tx);
        let events = collect(rx).await;
        handle.join().await;

        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepStart { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(starts, StepName::BASE_PIPELINE.to_vec());

        let completes = events
            .iter()
            .filter(|e| matches!(e, RunEvent::RunComplete { .. }))
            .count();
        assert_eq!(completes, 1);
        assert!(matches!(events.last(), Some(RunEvent::RunComplete { .. })));

        let Some(RunEvent::RunComplete { data: Some(patch), .. }) = events.last() else {
            panic!("run_complete without data");
        };
        assert_eq!(patch.status, Some(RunStatus::Success));
        assert!(patch.generated_tests.as_deref().unwrap().contains("def test_add_basic"));
    }

    #[tokio::test]
    async fn open_pr_step_runs_last_when_requested() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let record = RunRecord::queued("run_pr".into(), spec(true));
        store.save(&record);

        let driver = SimulatedDriver::new(store, fast());
        let (tx, rx) = mpsc::unbounded_channel();
        driver.start("run_pr", &record.spec, tx);
        let events = collect(rx).await;

        let last_step = events.iter().rev().find_map(|e| match e {
            RunEvent::StepComplete { step, data, .. } => Some((*step, data.clone())),
            _ => None,
        });
        let (step, data) = last_step.unwrap();
        assert_eq!(step, StepName::OpenPr);
        let pr = data.unwrap().pr.unwrap();
        assert_eq!(pr.changed_files, vec!["experiments/run_pr/test_add.py".to_string()]);
        assert!(pr.url.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_before_run_complete() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let record = RunRecord::queued("run_c".into(), spec(false));
        store.save(&record);

        let timing = SimulationTiming {
            pacing: Duration::from_secs(30),
            ..fast()
        };
        let driver = SimulatedDriver::new(store, timing);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = driver.start("run_c", &record.spec, tx);

        while let Some(ev) = rx.recv().await {
            if matches!(ev, RunEvent::StepComplete { .. }) {
                handle.cancel();
                break;
            }
        }
        let rest = collect(rx).await;
        assert!(rest
            .iter()
            .all(|e| !matches!(e, RunEvent::RunComplete { .. } | RunEvent::StepStart { .. })));
    }

    #[tokio::test]
    async fn resumes_after_completed_steps() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let mut record = RunRecord::queued("run_r".into(), spec(false));
        record.status = RunStatus::Running;
        for name in [StepName::ReadCode, StepName::InferBehavior] {
            record.step_mut(name).unwrap().status = StepStatus::Success;
        }
        store.save(&record);

        let driver = SimulatedDriver::new(store, fast());
        let (tx, rx) = mpsc::unbounded_channel();
        driver.start("run_r", &record.spec, tx);
        let events = collect(rx).await;

        let first_start = events.iter().find_map(|e| match e {
            RunEvent::StepStart { step, .. } => Some(*step),
            _ => None,
        });
        assert_eq!(first_start, Some(StepName::GenerateTests));
    }

    #[tokio::test]
    async fn missing_record_yields_a_log_and_nothing_else() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.json"));
        let driver = SimulatedDriver::new(store, fast());
        let (tx, rx) = mpsc::unbounded_channel();
        driver.start("run_missing", &spec(false), tx);
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RunEvent::Log { message, .. } if message.contains("not found")));
    }
}
