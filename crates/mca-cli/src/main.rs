use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mca", version = "0.1.0", about = "Repeated-trial runner for numerically perturbed test suites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the containerized test suite once per trial under perturbation.
    Run {
        experiment: PathBuf,
        #[arg(long)]
        level: String,
        #[arg(long)]
        mode: String,
        /// Explicit trial index (takes precedence over the scheduler's).
        #[arg(long)]
        trial: Option<u32>,
        /// Number of trials for the in-process loop (defaults to the
        /// experiment's design.trials).
        #[arg(long)]
        trials: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved experiment without running anything.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize per-trial pytest results across a finished run.
    Analyze {
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
        #[arg(long)]
        level: String,
        #[arg(long)]
        mode: String,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        init: bool,
        #[arg(long, value_name = "DIR")]
        results: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            level,
            mode,
            trial,
            trials,
            json,
        } => {
            let summary =
                mca_runner::describe_experiment(&experiment, Some(&level), Some(&mode))?;
            let selection = if let Some(idx) = trial {
                mca_runner::TrialSelection::Single(idx)
            } else if let Some(idx) = mca_runner::scheduler_trial_index() {
                mca_runner::TrialSelection::Single(idx)
            } else {
                mca_runner::TrialSelection::Count(trials.unwrap_or(summary.trials))
            };
            let result = mca_runner::run_trials(&experiment, &level, &mode, selection)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "run": run_result_to_json(&result),
                })));
            }
            print_summary(&summary);
            println!("results_dir: {}", result.results_dir.display());
            println!("manifest: {}", result.manifest_path.display());
            for record in &result.trials {
                println!(
                    "trial {}: exit {} log {}",
                    record.trial,
                    record.exit_status,
                    record.log_path.display()
                );
            }
        }
        Commands::Describe {
            experiment,
            level,
            mode,
            json,
        } => {
            let summary =
                mca_runner::describe_experiment(&experiment, level.as_deref(), mode.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Analyze {
            results_dir,
            level,
            mode,
            json,
        } => {
            let report = mca_analysis::analyze(&results_dir, &level, &mode)?;
            let path = mca_analysis::write_analysis(&results_dir, &report)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze",
                    "analysis_path": path.display().to_string(),
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print!("{}", mca_analysis::render_report(&report));
            println!("analysis: {}", path.display());
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join("experiment.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, EXPERIMENT_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", path.display());
            println!("next: mca describe {}", path.display());
        }
        Commands::Clean { init, results } => {
            if init {
                let path = std::env::current_dir()?.join("experiment.yaml");
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                    println!("removed: {}", path.display());
                }
            }
            if let Some(dir) = results {
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                    println!("removed: {}", dir.display());
                }
            }
        }
    }
    Ok(None)
}

const EXPERIMENT_TEMPLATE: &str = "\
version: '0.1'
experiment:
  id: ''                              # REQUIRED
suite:
  command: []                         # REQUIRED: e.g. [python, -m, pytest, pyAFQ/AFQ/tests]
  exclude_markers: [nightly]          # long-running categories skipped by label
design:
  trials: 0                           # REQUIRED: set > 0
runtime:
  container:
    runtime: apptainer                # REQUIRED
    image_dir: ''                     # REQUIRED: directory holding <prefix>-<level>*.sif
    image_prefix: pyafq-fuzzy         # REQUIRED
    root: /AFQ                        # REQUIRED: container workdir and home
    home: ''                          # host path mapped onto root (optional)
  backends:
    dir: ''                           # REQUIRED: container dir holding vfc_backends.<mode>.txt
  binds: []                           # e.g. {host: /scratch/templateflow, guest: /AFQ/.cache/templateflow}
results:
  dir: results                        # REQUIRED
";

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Analyze { json, .. } => *json,
        _ => false,
    }
}

fn run_result_to_json(result: &mca_runner::RunResult) -> Value {
    json!({
        "level": result.level,
        "mode": result.mode,
        "image": result.image.display().to_string(),
        "results_dir": result.results_dir.display().to_string(),
        "manifest": result.manifest_path.display().to_string(),
        "trials": result.trials.iter().map(|t| json!({
            "trial": t.trial,
            "log": t.log_path.display().to_string(),
            "exit_status": t.exit_status,
        })).collect::<Vec<_>>(),
    })
}

fn summary_to_json(summary: &mca_runner::ExperimentSummary) -> Value {
    json!({
        "experiment": summary.exp_id,
        "runtime": summary.runtime,
        "image_dir": summary.image_dir.display().to_string(),
        "image_prefix": summary.image_prefix,
        "container_root": summary.container_root,
        "backends_dir": summary.backends_dir,
        "results_dir": summary.results_dir.display().to_string(),
        "trials": summary.trials,
        "suite_command": summary.suite_command,
        "exclude_markers": summary.exclude_markers,
        "binds": summary.bind_count,
        "image_glob": summary.image_glob,
        "image_resolved": summary.image_resolved.as_ref().map(|p| p.display().to_string()),
        "image_error": summary.image_error,
        "backend_file": summary.backend_file,
    })
}

fn print_summary(summary: &mca_runner::ExperimentSummary) {
    println!("experiment: {}", summary.exp_id);
    println!("runtime: {}", summary.runtime);
    println!("image_dir: {}", summary.image_dir.display());
    println!("image_prefix: {}", summary.image_prefix);
    println!("container_root: {}", summary.container_root);
    println!("backends_dir: {}", summary.backends_dir);
    println!("results_dir: {}", summary.results_dir.display());
    println!("trials: {}", summary.trials);
    println!("suite_command: {:?}", summary.suite_command);
    println!("exclude_markers: {:?}", summary.exclude_markers);
    println!("binds: {}", summary.bind_count);
    if let Some(glob) = &summary.image_glob {
        println!("image_glob: {}", glob);
    }
    if let Some(image) = &summary.image_resolved {
        println!("image: {}", image.display());
    }
    if let Some(err) = &summary.image_error {
        println!("image_error: {}", err);
    }
    if let Some(backend) = &summary.backend_file {
        println!("backend_file: {}", backend);
    }
}
