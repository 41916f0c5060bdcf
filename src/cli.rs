use crate::codegen::{CodeKind, CodegenClient};
use crate::config::{
    normalize_api_url, AppConfig, OpenAiConfig, DEFAULT_API_URL, DEFAULT_OPENAI_BASE_URL,
    DEFAULT_OPENAI_MODEL,
};
use crate::driver::{ExecutorClient, RemoteDriver, RunDriver, SimulatedDriver, SimulationTiming};
use crate::model::{EdgeCaseCategories, RunEvent, RunOptions, RunSpecification, TestStyle};
use crate::orchestrator::RunController;
use crate::store::{default_patch_file_name, export_json, export_patch, RunStore};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "veritas-pytest",
    version,
    about = "Generate, run and track AI-written pytest suites for Python code"
)]
pub struct Cli {
    /// Base URL of the test-generation executor
    #[arg(long, global = true, env = "VERITAS_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Simulate runs locally instead of calling the executor.
    /// Use --mock true or --mock false to override
    #[arg(
        long,
        global = true,
        env = "VERITAS_USE_MOCK_API",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub mock: bool,

    /// Run history file (defaults to the platform data directory)
    #[arg(long, global = true, env = "VERITAS_STORE")]
    pub store: Option<PathBuf>,

    /// Chat model used by `generate`
    #[arg(long, global = true, env = "OPENAI_MODEL", default_value = DEFAULT_OPENAI_MODEL)]
    pub openai_model: String,

    /// Base URL of the chat-completions API used by `generate`
    #[arg(long, global = true, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide = true, hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Submit a run for a Python file and stream it to completion (Ctrl-C cancels)
    Run(RunArgs),
    /// Reattach to a queued or running run
    Resume { run_id: String },
    /// Show one run
    Show(ShowArgs),
    /// List stored runs, newest first
    List,
    /// Delete a stored run
    Delete { run_id: String },
    /// Cancel a run started elsewhere
    Cancel { run_id: String },
    /// Write a run's record and/or patch to disk
    Export(ExportArgs),
    /// Generate Python code from a description
    Generate(GenerateArgs),
    /// List the top-level functions and classes in a Python file
    Symbols {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Python source file containing the code under test
    #[arg(long)]
    pub file: PathBuf,

    /// Function or class to test (defaults to the first one in the file)
    #[arg(long)]
    pub function: Option<String>,

    /// Upper bound on fix-and-rerun iterations
    #[arg(long, default_value_t = 3)]
    pub max_iterations: u32,

    #[arg(long, value_enum, default_value_t = TestStyle::Unit)]
    pub test_style: TestStyle,

    /// Minimum line coverage, in percent
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub coverage_threshold: u8,

    /// Comma-separated edge-case categories: none, empty, large, unicode, floats, timezones
    #[arg(long, default_value = "empty,large")]
    pub edge_cases: String,

    /// Open a pull request with the generated tests
    #[arg(long)]
    pub create_pr: bool,

    /// Repository the pull request targets
    #[arg(long)]
    pub repo_url: Option<String>,

    #[arg(long, default_value = "main")]
    pub branch: String,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    pub run_id: String,
    /// Print the generated test source
    #[arg(long, conflicts_with_all = ["diff", "pr", "json"])]
    pub tests: bool,
    /// Print the patch
    #[arg(long, conflicts_with_all = ["pr", "json"])]
    pub diff: bool,
    /// Print the pull request description
    #[arg(long, conflicts_with = "json")]
    pub pr: bool,
    /// Print the full record as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ExportArgs {
    pub run_id: String,
    /// Write the record as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,
    /// Write the patch (default when no target is given)
    #[arg(long)]
    pub patch: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct GenerateArgs {
    /// What the code should do
    #[arg(long)]
    pub prompt: String,
    #[arg(long, value_enum, default_value_t = CodeKind::Function)]
    pub kind: CodeKind,
    /// Write the code here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Resolve process-wide settings from CLI arguments and their env fallbacks.
pub fn build_config(args: &Cli) -> Result<AppConfig> {
    let store_path = match args.store.clone() {
        Some(p) => p,
        None => RunStore::default_path()?,
    };
    Ok(AppConfig {
        api_url: normalize_api_url(&args.api_url),
        use_mock: args.mock,
        store_path,
        openai: OpenAiConfig {
            base_url: args.openai_base_url.trim_end_matches('/').to_string(),
            model: args.openai_model.clone(),
            api_key: args.openai_api_key.clone(),
        },
    })
}

/// Pick the driver once for the whole process.
fn compose_driver(cfg: &AppConfig, store: &RunStore) -> Result<Arc<dyn RunDriver>> {
    if cfg.use_mock {
        tracing::debug!("using simulated driver");
        return Ok(Arc::new(SimulatedDriver::new(
            store.clone(),
            SimulationTiming::default(),
        )));
    }
    tracing::debug!(api_url = %cfg.api_url, "using remote driver");
    let client = ExecutorClient::new(&cfg.api_url).context("failed to build HTTP client")?;
    Ok(Arc::new(RemoteDriver::new(client, store.clone())))
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    let store = RunStore::open(cfg.store_path.clone());
    let (out_tx, out_handle) = spawn_output_writer();
    let res = dispatch(&cfg, store, args.command, &out_tx).await;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn dispatch(
    cfg: &AppConfig,
    store: RunStore,
    command: Command,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let controller = |store: RunStore| -> Result<RunController> {
        let driver = compose_driver(cfg, &store)?;
        Ok(RunController::new(store, driver))
    };

    match command {
        Command::Run(run) => {
            let spec = build_spec(&run)?;
            let mut controller = controller(store)?;
            let record = controller.submit(spec).await?;
            let _ = out_tx.send(OutputLine::Stderr(format!(
                "Started {} for {}",
                record.run_id, record.spec.function_name
            )));
            stream_to_end(&mut controller, out_tx).await
        }
        Command::Resume { run_id } => {
            let mut controller = controller(store)?;
            controller.activate(&run_id).await?;
            if !controller.is_streaming() {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Run {run_id} has already finished"
                )));
            }
            stream_to_end(&mut controller, out_tx).await
        }
        Command::Show(show) => {
            let mut controller = controller(store)?;
            let record = controller.open(&show.run_id).await?;
            let text = if show.json {
                serde_json::to_string_pretty(record)?
            } else if show.tests {
                record.generated_tests.clone()
            } else if show.diff {
                record.patch_diff.clone()
            } else if show.pr {
                match record.pr.as_ref() {
                    Some(pr) => format!("{}\n\n{}", pr.title, pr.body),
                    None => bail!("Run {} has no pull request", record.run_id),
                }
            } else {
                crate::text_summary::build_text_summary(record).lines.join("\n")
            };
            let _ = out_tx.send(OutputLine::Stdout(text));
            Ok(())
        }
        Command::List => {
            if store.is_empty() {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "No runs stored in {}",
                    store.path().display()
                )));
                return Ok(());
            }
            for line in crate::text_summary::history_lines(&store.list_all()) {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
            Ok(())
        }
        Command::Delete { run_id } => {
            if !store.delete(&run_id) {
                bail!("Run {run_id} not found");
            }
            let _ = out_tx.send(OutputLine::Stderr(format!("Deleted {run_id}")));
            Ok(())
        }
        Command::Cancel { run_id } => {
            let mut controller = controller(store)?;
            controller.open(&run_id).await?;
            let record = controller.cancel().await?;
            let _ = out_tx.send(OutputLine::Stderr(format!(
                "Run {} is {}",
                record.run_id,
                record.status.as_str()
            )));
            Ok(())
        }
        Command::Export(export) => {
            let mut controller = controller(store)?;
            let record = controller.open(&export.run_id).await?;
            let patch = match (&export.json, &export.patch) {
                (None, None) => Some(PathBuf::from(default_patch_file_name(&record.run_id))),
                (_, p) => p.clone(),
            };
            if let Some(p) = export.json.as_deref() {
                export_json(p, record)?;
                let _ = out_tx.send(OutputLine::Stderr(format!("Wrote {}", p.display())));
            }
            if let Some(p) = patch.as_deref() {
                export_patch(p, record)?;
                let _ = out_tx.send(OutputLine::Stderr(format!("Wrote {}", p.display())));
            }
            Ok(())
        }
        Command::Generate(gen) => run_generate(cfg, gen, out_tx).await,
        Command::Symbols { file } => run_symbols(&file, out_tx),
    }
}

/// Relay driver progress until the run finishes, the stream gives up, or Ctrl-C.
async fn stream_to_end(
    controller: &mut RunController,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let mut printed = controller.log().len();
    loop {
        tokio::select! {
            ev = controller.next_event() => {
                match ev {
                    Some(RunEvent::StepStart { step, .. }) => {
                        let _ = out_tx.send(OutputLine::Stderr(format!("== {} ==", step.label())));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = out_tx.send(OutputLine::Stderr("Cancelling…".into()));
                controller.cancel().await?;
                break;
            }
        }
        for line in &controller.log()[printed..] {
            let _ = out_tx.send(OutputLine::Stderr(line.clone()));
        }
        printed = controller.log().len();
    }
    for line in controller.log().iter().skip(printed) {
        let _ = out_tx.send(OutputLine::Stderr(line.clone()));
    }

    let Some(record) = controller.current() else {
        return Ok(());
    };
    for line in crate::text_summary::build_text_summary(record).lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    if !record.status.is_terminal() {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Run is still {}; reattach with `veritas-pytest resume {}`",
            record.status.as_str(),
            record.run_id
        )));
    }
    Ok(())
}

fn build_spec(run: &RunArgs) -> Result<RunSpecification> {
    let code = std::fs::read_to_string(&run.file)
        .with_context(|| format!("failed to read {}", run.file.display()))?;
    let function_name = match run.function.clone() {
        Some(name) => name,
        None => crate::symbols::discover(&code)
            .into_iter()
            .next()
            .map(|s| s.name)
            .unwrap_or_default(),
    };
    let edge_case_categories = EdgeCaseCategories::from_names(
        run.edge_cases
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty()),
    )
    .map_err(anyhow::Error::msg)?;
    Ok(RunSpecification {
        code,
        function_name,
        options: RunOptions {
            max_iterations: run.max_iterations,
            test_style: run.test_style,
            coverage_threshold: run.coverage_threshold,
            edge_case_categories,
            create_pr: run.create_pr,
            repo_url: run.repo_url.clone(),
            branch: run.branch.clone(),
        },
    })
}

async fn run_generate(
    cfg: &AppConfig,
    args: GenerateArgs,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let client = CodegenClient::new(cfg.openai.clone()).context("failed to build HTTP client")?;
    let code = client.generate(&args.prompt, args.kind).await?;
    match args.out {
        Some(p) => {
            std::fs::write(&p, format!("{code}\n"))
                .with_context(|| format!("failed to write {}", p.display()))?;
            let _ = out_tx.send(OutputLine::Stderr(format!("Wrote {}", p.display())));
        }
        None => {
            let _ = out_tx.send(OutputLine::Stdout(code));
        }
    }
    Ok(())
}

fn run_symbols(file: &std::path::Path, out_tx: &mpsc::UnboundedSender<OutputLine>) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let symbols = crate::symbols::discover(&code);
    if symbols.is_empty() {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "No functions or classes found in {}",
            file.display()
        )));
    }
    for s in symbols {
        let kind = match s.kind {
            crate::symbols::SymbolKind::Function => "function",
            crate::symbols::SymbolKind::Class => "class",
        };
        let _ = out_tx.send(OutputLine::Stdout(format!("{}\t{kind}\tline {}", s.name, s.line)));
    }
    Ok(())
}
