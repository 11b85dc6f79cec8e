use anyhow::{anyhow, Result};
use chrono::Utc;
use mca_core::{
    atomic_write_json_pretty, backend_file_path, canonical_json_digest, ensure_dir,
    image_glob_pattern, resolve_image, sha256_file, RunIdentity,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Environment variables wired into the container: backend configuration
/// file selection, and the backend's per-operation logger switch (always
/// off during trials).
pub const ENV_BACKENDS_FROM_FILE: &str = "VFC_BACKENDS_FROM_FILE";
pub const ENV_BACKENDS_LOGGER: &str = "VFC_BACKENDS_LOGGER";

/// Which trial indices a run covers: one index handed in by an external
/// job-array scheduler, or an in-process loop over 1..=count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialSelection {
    Single(u32),
    Count(u32),
}

impl TrialSelection {
    pub fn indices(self) -> Vec<u32> {
        match self {
            TrialSelection::Single(idx) => vec![idx],
            TrialSelection::Count(n) => (1..=n).collect(),
        }
    }
}

/// Trial index supplied by the job-array scheduler, if any.
pub fn scheduler_trial_index() -> Option<u32> {
    std::env::var("SLURM_ARRAY_TASK_ID")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
}

#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub trial: u32,
    pub log_path: PathBuf,
    pub exit_status: String,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub level: String,
    pub mode: String,
    pub image: PathBuf,
    pub results_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub trials: Vec<TrialRecord>,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub exp_id: String,
    pub runtime: String,
    pub image_dir: PathBuf,
    pub image_prefix: String,
    pub container_root: String,
    pub backends_dir: String,
    pub results_dir: PathBuf,
    pub trials: u32,
    pub suite_command: Vec<String>,
    pub exclude_markers: Vec<String>,
    pub bind_count: usize,
    pub image_glob: Option<String>,
    pub image_resolved: Option<PathBuf>,
    pub image_error: Option<String>,
    pub backend_file: Option<String>,
}

#[derive(Debug, Clone)]
struct ContainerConfig {
    runtime: String,
    image_dir: PathBuf,
    image_prefix: String,
    root: String,
    home: Option<String>,
    cleanenv: bool,
    binds: Vec<(String, String)>,
    backends_dir: String,
}

#[derive(Debug, Clone)]
struct SuiteConfig {
    command: Vec<String>,
    exclude_markers: Vec<String>,
}

struct RunStateGuard {
    path: PathBuf,
    level: String,
    mode: String,
    done: bool,
}

impl RunStateGuard {
    fn new(path: &Path, level: &str, mode: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            level: level.to_string(),
            mode: mode.to_string(),
            done: false,
        }
    }

    fn write(&self, status: &str) -> Result<()> {
        let payload = json!({
            "schema_version": "run_state_v1",
            "level": self.level,
            "mode": self.mode,
            "status": status,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.path, &payload)
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        self.write(status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write("failed");
        }
    }
}

pub fn load_experiment(path: &Path) -> Result<Value> {
    let raw_yaml = fs::read_to_string(path)?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&json_value)?;
    Ok(json_value)
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/experiment/id",
        "/suite/command",
        "/design/trials",
        "/runtime/container/runtime",
        "/runtime/container/image_dir",
        "/runtime/container/image_prefix",
        "/runtime/container/root",
        "/runtime/backends/dir",
        "/results/dir",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let value = json_value.pointer(pointer);
        let is_missing = match value {
            None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Number(n)) => n.as_u64() == Some(0) && *pointer == "/design/trials",
            Some(Value::Array(a)) => a.is_empty() && *pointer == "/suite/command",
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "experiment.yaml missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

fn string_list(json_value: &Value, pointer: &str) -> Vec<String> {
    json_value
        .pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().unwrap_or("").to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_container(json_value: &Value, exp_dir: &Path) -> Result<ContainerConfig> {
    let container = json_value
        .pointer("/runtime/container")
        .ok_or_else(|| anyhow!("runtime.container missing"))?;
    let runtime = container
        .pointer("/runtime")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /runtime/container/runtime"))?
        .to_string();
    let image_dir_raw = container
        .pointer("/image_dir")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /runtime/container/image_dir"))?;
    let image_dir = resolve_relative(exp_dir, image_dir_raw);
    let image_prefix = container
        .pointer("/image_prefix")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /runtime/container/image_prefix"))?
        .to_string();
    let root = container
        .pointer("/root")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /runtime/container/root"))?
        .to_string();
    let home = container
        .pointer("/home")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let cleanenv = container
        .pointer("/cleanenv")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let backends_dir = json_value
        .pointer("/runtime/backends/dir")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /runtime/backends/dir"))?
        .to_string();

    let mut binds = Vec::new();
    if let Some(entries) = json_value.pointer("/runtime/binds").and_then(|v| v.as_array()) {
        for entry in entries {
            let host = entry
                .get("host")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("bind entry missing host"))?;
            let guest = entry
                .get("guest")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("bind entry missing guest"))?;
            binds.push((
                resolve_relative(exp_dir, host).display().to_string(),
                guest.to_string(),
            ));
        }
    }

    Ok(ContainerConfig {
        runtime,
        image_dir,
        image_prefix,
        root,
        home,
        cleanenv,
        binds,
        backends_dir,
    })
}

fn resolve_suite(json_value: &Value) -> Result<SuiteConfig> {
    let command = string_list(json_value, "/suite/command");
    if command.is_empty() || command.iter().any(|p| p.is_empty()) {
        return Err(anyhow!("suite.command must be a non-empty list of strings"));
    }
    Ok(SuiteConfig {
        command,
        exclude_markers: string_list(json_value, "/suite/exclude_markers"),
    })
}

fn resolve_relative(exp_dir: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        exp_dir.join(p)
    }
}

fn experiment_dir(path: &Path) -> PathBuf {
    path.parent()
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| path.parent().unwrap_or(Path::new(".")).to_path_buf())
}

/// `-m "not a and not b"` expression excluding the long-running categories.
fn marker_expression(markers: &[String]) -> Option<String> {
    if markers.is_empty() {
        return None;
    }
    Some(
        markers
            .iter()
            .map(|m| format!("not {}", m))
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

/// Full argv passed to the container runtime for one trial, after the
/// runtime binary itself. Kept as a pure function so the exact invocation
/// stays testable without a container runtime installed.
fn container_args(
    container: &ContainerConfig,
    suite: &SuiteConfig,
    image: &Path,
    backend_file: &str,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if container.cleanenv {
        args.push("--cleanenv".to_string());
    }
    args.push("--pwd".to_string());
    args.push(container.root.clone());
    if let Some(home) = &container.home {
        args.push("--home".to_string());
        args.push(format!("{}:{}", home, container.root));
    }
    for (host, guest) in &container.binds {
        args.push("-B".to_string());
        args.push(format!("{}:{}", host, guest));
    }
    args.push("--env".to_string());
    args.push(format!("{}={}", ENV_BACKENDS_FROM_FILE, backend_file));
    args.push("--env".to_string());
    args.push(format!("{}=False", ENV_BACKENDS_LOGGER));
    args.push(image.display().to_string());
    args.extend(suite.command.iter().cloned());
    if let Some(expr) = marker_expression(&suite.exclude_markers) {
        args.push("-m".to_string());
        args.push(expr);
    }
    args
}

/// Run the containerized suite once per selected trial index, writing each
/// trial's combined stdout/stderr to `results/log.{level}.{mode}.{trial}`.
/// A failing trial is recorded and logged but does not stop later trials;
/// trials share no state beyond the read-only image and the bind mounts.
pub fn run_trials(
    path: &Path,
    level: &str,
    mode: &str,
    selection: TrialSelection,
) -> Result<RunResult> {
    let json_value = load_experiment(path)?;
    let exp_dir = experiment_dir(path);
    let container = resolve_container(&json_value, &exp_dir)?;
    let suite = resolve_suite(&json_value)?;

    let results_raw = json_value
        .pointer("/results/dir")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /results/dir"))?;
    let results_dir = resolve_relative(&exp_dir, results_raw);
    ensure_dir(&results_dir)?;

    let image = resolve_image(&container.image_dir, &container.image_prefix, level)?;
    let backend_file = backend_file_path(Path::new(&container.backends_dir), mode)
        .display()
        .to_string();

    let state_id = RunIdentity::new(level, mode, 0);
    let mut guard = RunStateGuard::new(
        &results_dir.join(state_id.run_state_file_name()),
        level,
        mode,
    );
    guard.write("running")?;

    let indices = selection.indices();
    tracing::info!(
        level,
        mode,
        trials = indices.len(),
        image = %image.display(),
        "starting perturbed trial run"
    );

    let mut trials = Vec::new();
    for trial in indices {
        let identity = RunIdentity::new(level, mode, trial);
        let log_path = identity.log_path(&results_dir);
        let exit_status = run_one_trial(&container, &suite, &image, &backend_file, &log_path)?;
        if exit_status != "0" {
            tracing::warn!(trial, exit_status = %exit_status, log = %log_path.display(), "trial exited non-zero");
        } else {
            tracing::info!(trial, log = %log_path.display(), "trial completed");
        }
        trials.push(TrialRecord {
            trial,
            log_path,
            exit_status,
        });
    }

    let manifest_path = results_dir.join(state_id.manifest_file_name());
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "level": level,
        "mode": mode,
        "image": image.display().to_string(),
        "image_digest": sha256_file(&image)?,
        "image_glob": image_glob_pattern(&container.image_dir, &container.image_prefix, level),
        "backend_file": backend_file,
        "experiment_digest": canonical_json_digest(&json_value),
        "suite_command": suite.command,
        "exclude_markers": suite.exclude_markers,
        "trials": trials.iter().map(|t| json!({
            "trial": t.trial,
            "log": t.log_path.display().to_string(),
            "exit_status": t.exit_status,
        })).collect::<Vec<_>>(),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&manifest_path, &manifest)?;
    guard.complete("completed")?;

    Ok(RunResult {
        level: level.to_string(),
        mode: mode.to_string(),
        image,
        results_dir,
        manifest_path,
        trials,
    })
}

fn run_one_trial(
    container: &ContainerConfig,
    suite: &SuiteConfig,
    image: &Path,
    backend_file: &str,
    log_path: &Path,
) -> Result<String> {
    let log_file = fs::File::create(log_path)?;
    let stderr_file = log_file.try_clone()?;

    let mut cmd = Command::new(&container.runtime);
    cmd.args(container_args(container, suite, image, backend_file));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log_file));
    cmd.stderr(Stdio::from(stderr_file));

    let status = cmd.spawn()?.wait()?;
    Ok(status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string()))
}

pub fn describe_experiment(
    path: &Path,
    level: Option<&str>,
    mode: Option<&str>,
) -> Result<ExperimentSummary> {
    let json_value = load_experiment(path)?;
    let exp_dir = experiment_dir(path);
    let container = resolve_container(&json_value, &exp_dir)?;
    let suite = resolve_suite(&json_value)?;

    let exp_id = json_value
        .pointer("/experiment/id")
        .and_then(|v| v.as_str())
        .unwrap_or("exp")
        .to_string();
    let trials_raw = json_value
        .pointer("/design/trials")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow!("missing /design/trials"))?;
    let trials = u32::try_from(trials_raw)
        .map_err(|_| anyhow!("design.trials out of range: {}", trials_raw))?;
    let results_raw = json_value
        .pointer("/results/dir")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing /results/dir"))?;
    let results_dir = resolve_relative(&exp_dir, results_raw);

    let (image_glob, image_resolved, image_error) = match level {
        Some(level) => {
            let glob = image_glob_pattern(&container.image_dir, &container.image_prefix, level);
            match resolve_image(&container.image_dir, &container.image_prefix, level) {
                Ok(path) => (Some(glob), Some(path), None),
                Err(err) => (Some(glob), None, Some(err.to_string())),
            }
        }
        None => (None, None, None),
    };
    let backend_file = mode.map(|m| {
        backend_file_path(Path::new(&container.backends_dir), m)
            .display()
            .to_string()
    });

    Ok(ExperimentSummary {
        exp_id,
        runtime: container.runtime,
        image_dir: container.image_dir,
        image_prefix: container.image_prefix,
        container_root: container.root,
        backends_dir: container.backends_dir,
        results_dir,
        trials,
        suite_command: suite.command,
        exclude_markers: suite.exclude_markers,
        bind_count: container.binds.len(),
        image_glob,
        image_resolved,
        image_error,
        backend_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> Value {
        json!({
            "version": "0.1",
            "experiment": { "id": "pyafq-fuzzy" },
            "suite": {
                "command": ["python", "-m", "pytest", "pyAFQ/AFQ/tests"],
                "exclude_markers": ["nightly", "nightly_custom"]
            },
            "design": { "trials": 10 },
            "runtime": {
                "container": {
                    "runtime": "apptainer",
                    "image_dir": "/containers",
                    "image_prefix": "pyafq-fuzzy",
                    "root": "/AFQ",
                    "home": "/scratch/afq_home"
                },
                "backends": { "dir": "/AFQ/backends" },
                "binds": [
                    { "host": "/scratch/results", "guest": "/AFQ/results" },
                    { "host": "/scratch/templateflow", "guest": "/AFQ/.cache/templateflow" },
                    { "host": "/scratch/AFQ_data", "guest": "/AFQ/AFQ_data" }
                ]
            },
            "results": { "dir": "results" }
        })
    }

    #[test]
    fn validate_required_fields_passes_on_complete_config() {
        validate_required_fields(&sample_config()).expect("complete config should pass");
    }

    #[test]
    fn validate_required_fields_reports_all_missing() {
        let config = json!({
            "version": "0.1",
            "experiment": {},
            "suite": { "command": [] },
            "design": { "trials": 0 },
            "runtime": { "container": {}, "backends": {} },
            "results": {}
        });
        let err = validate_required_fields(&config).expect_err("should fail");
        let msg = err.to_string();
        for pointer in [
            "/experiment/id",
            "/suite/command",
            "/design/trials",
            "/runtime/container/runtime",
            "/runtime/container/image_dir",
            "/runtime/container/image_prefix",
            "/runtime/container/root",
            "/runtime/backends/dir",
            "/results/dir",
        ] {
            assert!(msg.contains(pointer), "missing {} in: {}", pointer, msg);
        }
    }

    #[test]
    fn trial_selection_single_wraps_scheduler_index() {
        assert_eq!(TrialSelection::Single(7).indices(), vec![7]);
    }

    #[test]
    fn trial_selection_count_runs_one_through_n() {
        assert_eq!(TrialSelection::Count(3).indices(), vec![1, 2, 3]);
        assert!(TrialSelection::Count(0).indices().is_empty());
    }

    #[test]
    fn marker_expression_joins_with_and() {
        let markers = vec!["nightly".to_string(), "nightly_custom".to_string()];
        assert_eq!(
            marker_expression(&markers).as_deref(),
            Some("not nightly and not nightly_custom")
        );
        assert_eq!(marker_expression(&[]), None);
    }

    #[test]
    fn container_args_carry_binds_env_and_marker_filter() {
        let config = sample_config();
        let exp_dir = Path::new("/work");
        let container = resolve_container(&config, exp_dir).expect("container");
        let suite = resolve_suite(&config).expect("suite");
        let args = container_args(
            &container,
            &suite,
            Path::new("/containers/pyafq-fuzzy-3-x.sif"),
            "/AFQ/backends/vfc_backends.rr.txt",
        );

        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--cleanenv".to_string()));

        let pwd_idx = args.iter().position(|a| a == "--pwd").expect("--pwd");
        assert_eq!(args[pwd_idx + 1], "/AFQ");
        let home_idx = args.iter().position(|a| a == "--home").expect("--home");
        assert_eq!(args[home_idx + 1], "/scratch/afq_home:/AFQ");

        let binds: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-B")
            .map(|(i, _)| &args[i + 1])
            .collect();
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0], "/scratch/results:/AFQ/results");

        assert!(args.contains(&format!(
            "{}=/AFQ/backends/vfc_backends.rr.txt",
            ENV_BACKENDS_FROM_FILE
        )));
        assert!(args.contains(&format!("{}=False", ENV_BACKENDS_LOGGER)));

        let image_idx = args
            .iter()
            .position(|a| a == "/containers/pyafq-fuzzy-3-x.sif")
            .expect("image");
        assert_eq!(args[image_idx + 1], "python");
        assert_eq!(args[args.len() - 2], "-m");
        assert_eq!(args[args.len() - 1], "not nightly and not nightly_custom");
    }

    #[test]
    fn container_args_without_markers_end_with_suite_command() {
        let mut config = sample_config();
        config["suite"]
            .as_object_mut()
            .unwrap()
            .remove("exclude_markers");
        let container = resolve_container(&config, Path::new("/work")).expect("container");
        let suite = resolve_suite(&config).expect("suite");
        let args = container_args(
            &container,
            &suite,
            Path::new("/containers/pyafq-fuzzy-3-x.sif"),
            "/AFQ/backends/vfc_backends.rr.txt",
        );
        assert_eq!(args.last().unwrap(), "pyAFQ/AFQ/tests");
    }

    #[test]
    fn describe_rejects_trial_counts_beyond_u32() {
        let dir = std::env::temp_dir().join(format!(
            "mca_runner_trials_range_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        let yaml = r#"version: '0.1'
experiment:
  id: pyafq-fuzzy
suite:
  command: [pytest]
design:
  trials: 4294967296
runtime:
  container:
    runtime: apptainer
    image_dir: /containers
    image_prefix: pyafq-fuzzy
    root: /AFQ
  backends:
    dir: /AFQ/backends
results:
  dir: results
"#;
        let path = dir.join("experiment.yaml");
        fs::write(&path, yaml).expect("experiment.yaml");
        let err = describe_experiment(&path, None, None).expect_err("out of range");
        assert!(
            err.to_string().contains("design.trials out of range"),
            "err: {}",
            err
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn relative_paths_resolve_against_experiment_dir() {
        assert_eq!(
            resolve_relative(Path::new("/work/exp"), "results"),
            PathBuf::from("/work/exp/results")
        );
        assert_eq!(
            resolve_relative(Path::new("/work/exp"), "/scratch/results"),
            PathBuf::from("/scratch/results")
        );
    }
}
