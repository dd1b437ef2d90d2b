//! Corrective feedback synthesized from a failed iteration.

use crate::decisions::Decision;
use crate::features::Snapshot;
use crate::gates::reports::Reports;
use crate::gates::{self, GateReport, GateResult};
use serde::{Deserialize, Serialize};

const MAX_EXCERPTS: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedItem {
    pub key: String,
    pub description: String,
    pub cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualShortfall {
    pub score: f64,
    pub threshold: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub iteration: u32,
    pub primary_failure: Option<String>,
    pub gate_failures: Vec<GateResult>,
    pub failing_tests: Vec<String>,
    pub failed_probes: Vec<String>,
    pub unmet_requirements: Vec<String>,
    pub blocked_items: Vec<BlockedItem>,
    pub visual: Option<VisualShortfall>,
    /// Every decision made so far, oldest first
    pub history: Vec<Decision>,
}

impl Feedback {
    pub fn synthesize(
        iteration: u32,
        primary_failure: Option<String>,
        gates: &GateReport,
        reports: &Reports,
        snapshot: &Snapshot,
        history: Vec<Decision>,
    ) -> Self {
        let failing_tests = reports
            .tests
            .as_ref()
            .map(|t| t.failures.iter().take(MAX_EXCERPTS).cloned().collect())
            .unwrap_or_default();

        let failed_probes = reports
            .probes
            .as_ref()
            .map(|trace| trace.failed().take(MAX_EXCERPTS).map(|p| p.describe()).collect())
            .unwrap_or_default();

        let unmet_requirements = reports
            .outcome
            .as_ref()
            .map(|o| {
                let mut o = o.clone();
                gates::ground_truth::reconcile(&mut o, reports.probes.as_ref());
                o.unmet.into_iter().take(MAX_EXCERPTS).collect()
            })
            .unwrap_or_default();

        let blocked_items = snapshot
            .blocked()
            .map(|item| BlockedItem {
                key: item.key(),
                description: item.description.clone(),
                cycles: item.cycles,
            })
            .collect();

        let visual = gates
            .gate(gates::VISUAL)
            .filter(|g| !g.skipped && !g.passed)
            .map(|g| VisualShortfall {
                score: g.value.unwrap_or(0.0),
                threshold: g.threshold.unwrap_or(0.0),
                issues: reports
                    .visual
                    .as_ref()
                    .map(|v| v.issues.iter().take(MAX_EXCERPTS).cloned().collect())
                    .unwrap_or_default(),
            });

        Self {
            iteration,
            primary_failure,
            gate_failures: gates.failures().cloned().collect(),
            failing_tests,
            failed_probes,
            unmet_requirements,
            blocked_items,
            visual,
            history,
        }
    }

    /// True when there is nothing to correct.
    pub fn is_empty(&self) -> bool {
        self.gate_failures.is_empty()
            && self.primary_failure.is_none()
            && self.failing_tests.is_empty()
            && self.failed_probes.is_empty()
            && self.unmet_requirements.is_empty()
            && self.blocked_items.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!("# Feedback for iteration {}\n", self.iteration);

        if let Some(reason) = &self.primary_failure {
            out.push_str(&format!("\n**Build failed:** {}\n", reason));
        }

        out.push_str("\n## Gate failures\n\n");
        if self.gate_failures.is_empty() {
            out.push_str("None.\n");
        }
        for gate in &self.gate_failures {
            out.push_str(&format!("- **{}**: {}\n", gate.name, gate.detail));
        }

        section(&mut out, "Failing tests", &self.failing_tests);
        section(&mut out, "Failed probes", &self.failed_probes);
        section(&mut out, "Unmet requirements", &self.unmet_requirements);

        if !self.blocked_items.is_empty() {
            out.push_str("\n## Blocked items\n\n");
            for item in &self.blocked_items {
                out.push_str(&format!(
                    "- `{}` ({} cycles): {}\n",
                    item.key, item.cycles, item.description
                ));
            }
        }

        if let Some(visual) = &self.visual {
            out.push_str(&format!(
                "\n## Visual\n\nScore {:.0} below {:.0}.\n",
                visual.score, visual.threshold
            ));
            for issue in &visual.issues {
                out.push_str(&format!("- {}\n", issue));
            }
        }

        if !self.history.is_empty() {
            out.push_str("\n## Decision history\n\n");
            for d in &self.history {
                out.push_str(&format!(
                    "- [{}] iteration {} `{}`: {}\n",
                    d.kind, d.iteration, d.target, d.decision
                ));
            }
        }
        out
    }
}

fn section(out: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {}\n\n", title));
    for line in lines {
        out.push_str(&format!("- {}\n", line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decisions::DecisionKind;
    use crate::features::{Counts, ItemStatus, ItemView};
    use crate::gates::Thresholds;
    use crate::gates::reports::{OutcomeReport, TestResults, VisualEval};

    fn reports() -> Reports {
        Reports {
            outcome: Some(OutcomeReport {
                coverage: Some(50.0),
                met: vec!["Signup".into()],
                unmet: vec!["Password reset".into()],
                ..Default::default()
            }),
            tests: Some(TestResults {
                framework: Some("pytest".into()),
                exit_code: 1,
                passed: 3,
                failed: 1,
                failures: vec!["tests/test_auth.py::test_reset".into()],
                ..Default::default()
            }),
            visual: Some(VisualEval {
                score: 40.0,
                issues: vec!["low contrast".into()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn snapshot() -> Snapshot {
        let mut snap = Snapshot::default();
        snap.items.push(ItemView {
            group: "auth".into(),
            id: "reset".into(),
            description: "Password reset".into(),
            status: ItemStatus::Blocked,
            cycles: 5,
        });
        snap.counts.add(ItemStatus::Blocked);
        snap
    }

    #[test]
    fn test_synthesize_collects_every_signal() {
        let reports = reports();
        let snap = snapshot();
        let gates = gates::evaluate(&reports, &snap.counts, &Thresholds::default());
        let history = vec![Decision::new(1, DecisionKind::Fix, "t", "fix it", "why")];

        let fb = Feedback::synthesize(2, None, &gates, &reports, &snap, history);
        let failed: Vec<&str> = fb.gate_failures.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(failed, vec!["coverage", "tests", "features", "visual"]);
        assert_eq!(fb.failing_tests, vec!["tests/test_auth.py::test_reset"]);
        assert_eq!(fb.unmet_requirements, vec!["Password reset"]);
        assert_eq!(fb.blocked_items[0].key, "auth/reset");
        assert_eq!(fb.visual.as_ref().unwrap().threshold, 70.0);
        assert_eq!(fb.history.len(), 1);
        assert!(!fb.is_empty());
    }

    #[test]
    fn test_markdown_sections() {
        let reports = reports();
        let snap = snapshot();
        let gates = gates::evaluate(&reports, &snap.counts, &Thresholds::default());
        let fb = Feedback::synthesize(2, Some("build: agent exited".into()), &gates, &reports, &snap, Vec::new());

        let md = fb.to_markdown();
        assert!(md.starts_with("# Feedback for iteration 2\n"));
        assert!(md.contains("**Build failed:** build: agent exited"));
        assert!(md.contains("## Failing tests\n\n- tests/test_auth.py::test_reset\n"));
        assert!(md.contains("- `auth/reset` (5 cycles): Password reset"));
        assert!(md.contains("Score 40 below 70."));
        assert!(!md.contains("Decision history"));
        assert!(!md.contains("Failed probes"));
    }

    #[test]
    fn test_passing_iteration_has_empty_feedback() {
        let gates = gates::evaluate(&Reports::default(), &Counts::default(), &Thresholds::default());
        let fb = Feedback::synthesize(1, None, &gates, &Reports::default(), &Snapshot::default(), Vec::new());
        assert!(fb.is_empty());
        assert!(fb.to_markdown().contains("None."));
    }
}
