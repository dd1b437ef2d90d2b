//! Quality gates.
//!
//! Each gate reads one signal, compares it with its threshold and reports
//! pass/fail. A gate with no underlying data is skipped and excluded from
//! the overall decision; with every gate skipped the decision is a vacuous
//! pass.

pub mod ground_truth;
pub mod reports;

use crate::config::Config;
use crate::crucible_config::QualitySection;
use crate::features::{Counts, FeatureStore};
use reports::Reports;
use serde::{Deserialize, Serialize};

pub const COVERAGE: &str = "coverage";
pub const TESTS: &str = "tests";
pub const FEATURES: &str = "features";
pub const VISUAL: &str = "visual";
pub const SMOKE: &str = "smoke";
pub const PROBES: &str = "probes";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub coverage: f64,
    pub tests_pass: bool,
    pub features_pass_rate: f64,
    pub visual_score: f64,
    pub probe_pass_rate: f64,
}

impl From<&QualitySection> for Thresholds {
    fn from(q: &QualitySection) -> Self {
        Self {
            coverage: q.coverage,
            tests_pass: q.tests_pass,
            features_pass_rate: q.features_pass_rate,
            visual_score: q.visual_score,
            probe_pass_rate: q.probe_pass_rate,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&QualitySection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub passed: bool,
    pub skipped: bool,
    #[serde(default)]
    pub detail: String,
}

impl GateResult {
    fn skipped(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            threshold: None,
            passed: false,
            skipped: true,
            detail: detail.into(),
        }
    }

    fn at_least(name: &str, value: f64, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value),
            threshold: Some(threshold),
            passed: value >= threshold,
            skipped: false,
            detail: format!("{:.1} (min {:.1})", value, threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub gates: Vec<GateResult>,
    pub passed: bool,
    /// Gates with data over total gates, in percent. Informational.
    pub completeness: f64,
}

impl GateReport {
    fn from_gates(gates: Vec<GateResult>) -> Self {
        let active: Vec<&GateResult> = gates.iter().filter(|g| !g.skipped).collect();
        let passed = active.iter().all(|g| g.passed);
        let completeness = if gates.is_empty() {
            0.0
        } else {
            active.len() as f64 / gates.len() as f64 * 100.0
        };
        Self {
            gates,
            passed,
            completeness,
        }
    }

    pub fn gate(&self, name: &str) -> Option<&GateResult> {
        self.gates.iter().find(|g| g.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateResult> {
        self.gates.iter().filter(|g| !g.skipped && !g.passed)
    }

    /// Observed coverage, when the coverage gate had data.
    pub fn coverage(&self) -> Option<f64> {
        self.gate(COVERAGE).and_then(|g| g.value)
    }
}

/// Evaluate every gate from the loaded reports and item counts.
pub fn evaluate(reports: &Reports, counts: &Counts, thresholds: &Thresholds) -> GateReport {
    let mut gates = Vec::with_capacity(6);

    // Coverage, after probe reconciliation.
    gates.push(match &reports.outcome {
        None => GateResult::skipped(COVERAGE, "no outcome report"),
        Some(outcome) => {
            let mut outcome = outcome.clone();
            ground_truth::reconcile(&mut outcome, reports.probes.as_ref());
            let total = outcome.met.len() + outcome.unmet.len();
            let value = outcome.coverage.or_else(|| {
                (total > 0).then(|| outcome.met.len() as f64 / total as f64 * 100.0)
            });
            match value {
                Some(v) => GateResult::at_least(COVERAGE, v, thresholds.coverage),
                None => GateResult::skipped(COVERAGE, "outcome report has no coverage"),
            }
        }
    });

    gates.push(match &reports.tests {
        None => GateResult::skipped(TESTS, "no test results"),
        Some(t) if t.framework.is_none() => GateResult::skipped(TESTS, "no test suite detected"),
        Some(t) => {
            let ok = t.failed == 0 && t.passed > 0;
            GateResult {
                name: TESTS.to_string(),
                value: Some(t.failed as f64),
                threshold: Some(0.0),
                passed: ok || !thresholds.tests_pass,
                skipped: false,
                detail: format!("{} passed, {} failed", t.passed, t.failed),
            }
        }
    });

    gates.push(if counts.total == 0 {
        GateResult::skipped(FEATURES, "no work items")
    } else {
        GateResult::at_least(FEATURES, counts.passed_pct(), thresholds.features_pass_rate)
    });

    gates.push(match &reports.visual {
        None => GateResult::skipped(VISUAL, "no visual evaluation"),
        Some(v) => GateResult::at_least(VISUAL, v.score, thresholds.visual_score),
    });

    gates.push(match &reports.smoke {
        None => GateResult::skipped(SMOKE, "no smoke test"),
        Some(s) => GateResult {
            name: SMOKE.to_string(),
            value: Some(if s.passed { 1.0 } else { 0.0 }),
            threshold: None,
            passed: s.passed,
            skipped: false,
            detail: if s.passed { "passed" } else { "failed" }.to_string(),
        },
    });

    gates.push(
        match reports.probes.as_ref().and_then(|trace| trace.pass_rate()) {
            None => GateResult::skipped(PROBES, "no runtime probes"),
            Some(rate) => GateResult::at_least(PROBES, rate, thresholds.probe_pass_rate),
        },
    );

    GateReport::from_gates(gates)
}

/// Load reports and item counts for a project and evaluate its gates.
pub fn evaluate_project(config: &Config, store: &FeatureStore) -> GateReport {
    let reports = Reports::load(&config.crucible_dir);
    let counts = store.snapshot().counts;
    evaluate(&reports, &counts, &Thresholds::from(&config.settings().quality))
}
