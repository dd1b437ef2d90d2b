//! Report files written by phases and external tools under `.crucible/`.
//!
//! Every report is optional. Unknown keys are preserved so a tool may carry
//! extra detail through a reconcile-and-rewrite cycle.

use crate::errors::GateError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const OUTCOME_REPORT: &str = "outcome-report.json";
pub const TEST_RESULTS: &str = "test-results.json";
pub const VISUAL_REPORT: &str = "visual-eval.json";
pub const SMOKE_REPORT: &str = "smoke-test.json";
pub const PROBE_REPORT: &str = "runtime-trace.json";

/// Requirements coverage as judged by the outcome evaluator.
///
/// `met` and `unmet` hold requirement labels. Endpoint requirements are
/// labelled `"METHOD /path"`, optionally followed by `": reason"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeReport {
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub met: Vec<String>,
    #[serde(default)]
    pub unmet: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<String>,
    /// Endpoint verdicts settled by runtime probes (`true` = met)
    #[serde(default, rename = "final", skip_serializing_if = "BTreeMap::is_empty")]
    pub finals: BTreeMap<String, bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResults {
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub output: String,
    /// Names or summary lines of failing tests
    #[serde(default)]
    pub failures: Vec<String>,
}

fn default_exit_code() -> i32 {
    -1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualEval {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeTest {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Probe {
    #[serde(default = "default_method")]
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub actual_status: Option<i64>,
    #[serde(default)]
    pub expected_status: Option<i64>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Probe {
    /// One-line failure description for feedback.
    pub fn describe(&self) -> String {
        let status = |s: Option<i64>| s.map(|v| v.to_string()).unwrap_or_else(|| "?".into());
        let mut line = format!(
            "{} {} -> {} (expected {})",
            self.method.to_uppercase(),
            self.endpoint,
            status(self.actual_status),
            status(self.expected_status)
        );
        if !self.missing_fields.is_empty() {
            line.push_str(&format!(" [missing fields: {}]", self.missing_fields.join(", ")));
        }
        line
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeSummary {
    #[serde(default)]
    pub pass_rate: Option<f64>,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeTrace {
    #[serde(default)]
    pub probes: Vec<Probe>,
    #[serde(default)]
    pub summary: Option<ProbeSummary>,
}

impl RuntimeTrace {
    /// Pass rate in percent, from the summary or computed from the probes.
    /// `None` when there is nothing to rate.
    pub fn pass_rate(&self) -> Option<f64> {
        if let Some(rate) = self.summary.as_ref().and_then(|s| s.pass_rate) {
            return Some(rate);
        }
        if self.probes.is_empty() {
            return None;
        }
        let passed = self.probes.iter().filter(|p| p.passed).count();
        Some(passed as f64 / self.probes.len() as f64 * 100.0)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Probe> {
        self.probes.iter().filter(|p| !p.passed)
    }
}

/// Read a report. `Ok(None)` when the file does not exist.
pub fn read_report<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, GateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(GateError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| GateError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// All reports present in one `.crucible/` directory.
#[derive(Debug, Clone, Default)]
pub struct Reports {
    pub outcome: Option<OutcomeReport>,
    pub tests: Option<TestResults>,
    pub visual: Option<VisualEval>,
    pub smoke: Option<SmokeTest>,
    pub probes: Option<RuntimeTrace>,
    /// Reports that exist but could not be read
    pub unreadable: Vec<String>,
}

impl Reports {
    pub fn load(crucible_dir: &Path) -> Self {
        let mut unreadable = Vec::new();
        let mut load = |name: &str| -> Option<Value> {
            match read_report::<Value>(&crucible_dir.join(name)) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("{}", e);
                    unreadable.push(name.to_string());
                    None
                }
            }
        };
        let outcome = load(OUTCOME_REPORT);
        let tests = load(TEST_RESULTS);
        let visual = load(VISUAL_REPORT);
        let smoke = load(SMOKE_REPORT);
        let probes = load(PROBE_REPORT);

        Self {
            outcome: typed(OUTCOME_REPORT, outcome, &mut unreadable),
            tests: typed(TEST_RESULTS, tests, &mut unreadable),
            visual: typed(VISUAL_REPORT, visual, &mut unreadable),
            smoke: typed(SMOKE_REPORT, smoke, &mut unreadable),
            probes: typed(PROBE_REPORT, probes, &mut unreadable),
            unreadable,
        }
    }
}

fn typed<T: DeserializeOwned>(
    name: &str,
    value: Option<Value>,
    unreadable: &mut Vec<String>,
) -> Option<T> {
    let value = value?;
    match serde_json::from_value(value) {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::warn!("{} has an unexpected shape: {}", name, e);
            unreadable.push(name.to_string());
            None
        }
    }
}
