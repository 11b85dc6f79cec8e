use anyhow::Result;
use chrono::Utc;
use mca_core::{atomic_write_json_pretty, RunIdentity};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Counts pulled from one trial's final pytest summary line, e.g.
/// `== 425 passed, 12 failed in 3625.25s ==`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrialCounts {
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
    pub seconds: f64,
}

pub struct SummaryParser {
    passed: Regex,
    failed: Regex,
    errors: Regex,
    seconds: Regex,
}

impl SummaryParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            passed: Regex::new(r"(\d+) passed")?,
            failed: Regex::new(r"(\d+) failed")?,
            errors: Regex::new(r"(\d+) errors?")?,
            seconds: Regex::new(r"in (\d+(?:\.\d+)?)s")?,
        })
    }

    fn capture_u64(re: &Regex, line: &str) -> Option<u64> {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// A line qualifies as a summary when it carries a wall-clock duration
    /// and at least one test count; everything else in a log is test chatter.
    pub fn parse_line(&self, line: &str) -> Option<TrialCounts> {
        let seconds: f64 = self
            .seconds
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())?;
        let passed = Self::capture_u64(&self.passed, line);
        let failed = Self::capture_u64(&self.failed, line);
        let errors = Self::capture_u64(&self.errors, line);
        if passed.is_none() && failed.is_none() && errors.is_none() {
            return None;
        }
        Some(TrialCounts {
            passed: passed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            errors: errors.unwrap_or(0),
            seconds,
        })
    }

    /// Last qualifying line wins; pytest may emit intermediate summaries on
    /// reruns and the final one reflects the whole session.
    pub fn parse_log(&self, path: &Path) -> Result<Option<TrialCounts>> {
        let data = fs::read_to_string(path)?;
        Ok(data.lines().rev().find_map(|line| self.parse_line(line)))
    }
}

/// `log.{level}.{mode}.{trial}` files directly under the results directory,
/// ordered by trial index.
pub fn collect_log_paths(results_dir: &Path, level: &str, mode: &str) -> Vec<(u32, PathBuf)> {
    let prefix = format!("log.{}.{}.", level, mode);
    let mut found = Vec::new();
    for entry in WalkDir::new(results_dir)
        .max_depth(1)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(suffix) = name.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(trial) = suffix.parse::<u32>() {
            found.push((trial, entry.into_path()));
        }
    }
    found.sort_by_key(|(trial, _)| *trial);
    found
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    /// Population standard deviation, matching numpy's default.
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self {
            mean,
            std: var.sqrt(),
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub stats: Stats,
    pub frequencies: BTreeMap<String, usize>,
}

impl MetricReport {
    fn from_values(values: &[f64]) -> Self {
        let mut frequencies: BTreeMap<String, usize> = BTreeMap::new();
        for v in values {
            *frequencies.entry(format_value(*v)).or_default() += 1;
        }
        Self {
            stats: Stats::compute(values),
            frequencies,
        }
    }
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub schema_version: String,
    pub level: String,
    pub mode: String,
    pub log_count: usize,
    pub parsed_count: usize,
    pub unparsed_logs: Vec<String>,
    pub passed: MetricReport,
    pub failed: MetricReport,
    pub errors: MetricReport,
    pub seconds: MetricReport,
    pub created_at: String,
}

/// Fold the per-trial summaries for `(level, mode)` into descriptive
/// statistics. Logs without a recognizable summary line (truncated or empty
/// after a failed container start) are reported, not fatal.
pub fn analyze(results_dir: &Path, level: &str, mode: &str) -> Result<AnalysisReport> {
    let parser = SummaryParser::new()?;
    let logs = collect_log_paths(results_dir, level, mode);

    let mut counts = Vec::new();
    let mut unparsed = Vec::new();
    for (trial, path) in &logs {
        match parser.parse_log(path)? {
            Some(c) => counts.push(c),
            None => {
                tracing::warn!(trial, log = %path.display(), "no summary line found");
                unparsed.push(path.display().to_string());
            }
        }
    }

    let passed: Vec<f64> = counts.iter().map(|c| c.passed as f64).collect();
    let failed: Vec<f64> = counts.iter().map(|c| c.failed as f64).collect();
    let errors: Vec<f64> = counts.iter().map(|c| c.errors as f64).collect();
    let seconds: Vec<f64> = counts.iter().map(|c| c.seconds).collect();

    Ok(AnalysisReport {
        schema_version: "analysis_v1".to_string(),
        level: level.to_string(),
        mode: mode.to_string(),
        log_count: logs.len(),
        parsed_count: counts.len(),
        unparsed_logs: unparsed,
        passed: MetricReport::from_values(&passed),
        failed: MetricReport::from_values(&failed),
        errors: MetricReport::from_values(&errors),
        seconds: MetricReport::from_values(&seconds),
        created_at: Utc::now().to_rfc3339(),
    })
}

pub fn write_analysis(results_dir: &Path, report: &AnalysisReport) -> Result<PathBuf> {
    let id = RunIdentity::new(&report.level, &report.mode, 0);
    let path = results_dir.join(id.analysis_file_name());
    atomic_write_json_pretty(&path, &serde_json::to_value(report)?)?;
    Ok(path)
}

pub fn render_report(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "level: {}\nmode: {}\nlogs: {} ({} parsed)\n",
        report.level, report.mode, report.log_count, report.parsed_count
    ));
    for path in &report.unparsed_logs {
        out.push_str(&format!("unparsed: {}\n", path));
    }
    for (name, metric) in [
        ("passed", &report.passed),
        ("failed", &report.failed),
        ("errors", &report.errors),
        ("seconds", &report.seconds),
    ] {
        out.push_str(&format!(
            "{}: mean {:.2} ± {:.2}, min-max [{}, {}]\n",
            name,
            metric.stats.mean,
            metric.stats.std,
            format_value(metric.stats.min),
            format_value(metric.stats.max),
        ));
        let freq = metric
            .frequencies
            .iter()
            .map(|(k, v)| format!("{}x{}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("{} frequencies: {}\n", name, freq));
    }
    out
}
