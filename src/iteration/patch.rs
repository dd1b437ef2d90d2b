//! Turning feedback into decisions and decisions into requirement edits.

use super::controller::SpecPatcher;
use super::feedback::Feedback;
use super::snapshot;
use crate::config::Config;
use crate::decisions::{Decision, DecisionKind, DecisionLog};
use crate::events::{EventStream, kinds};
use crate::gates::ground_truth::label_endpoint;
use crate::pipeline::process::run_bounded;
use crate::util::{line_count, write_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub fn iteration_marker(iteration: u32) -> String {
    format!("## Iteration {} corrections (auto-generated)", iteration)
}

/// Derive this iteration's decisions from `feedback`.
///
/// A decision whose kind and target repeat an earlier one is not issued
/// again, and nothing descoped earlier is enriched or detailed again. An
/// item constrained in an earlier iteration and still blocked is descoped.
pub fn derive_decisions(iteration: u32, feedback: &Feedback) -> Vec<Decision> {
    let history = &feedback.history;
    let issued: HashSet<(DecisionKind, &str)> = history
        .iter()
        .map(|d| (d.kind, d.target.as_str()))
        .collect();
    let descoped: HashSet<&str> = history
        .iter()
        .filter(|d| d.kind == DecisionKind::Descope)
        .map(|d| d.target.as_str())
        .collect();

    let mut out: Vec<Decision> = Vec::new();
    let mut push = |decision: Decision| {
        let target = decision.target.as_str();
        if issued.contains(&(decision.kind, target)) {
            return;
        }
        if descoped.contains(target) {
            return;
        }
        // An endpoint already under a fix gets no separate detail.
        if decision.kind == DecisionKind::Detail
            && (issued.contains(&(DecisionKind::Fix, target))
                || out
                    .iter()
                    .any(|d| d.kind == DecisionKind::Fix && d.target == decision.target))
        {
            return;
        }
        if out
            .iter()
            .any(|d| d.kind == decision.kind && d.target == decision.target)
        {
            return;
        }
        out.push(decision);
    };

    for test in &feedback.failing_tests {
        push(Decision::new(
            iteration,
            DecisionKind::Fix,
            test.as_str(),
            format!("Make the failing test `{}` pass without weakening it", test),
            format!("test failed in iteration {}", iteration),
        ));
    }

    for probe in &feedback.failed_probes {
        let target = label_endpoint(probe).unwrap_or_else(|| probe.clone());
        push(Decision::new(
            iteration,
            DecisionKind::Fix,
            target,
            format!("Endpoint must respond as specified: {}", probe),
            "runtime probe failed".to_string(),
        ));
    }

    for requirement in &feedback.unmet_requirements {
        // Probe verdicts carry the observed status; key them by endpoint.
        let target = label_endpoint(requirement).unwrap_or_else(|| requirement.clone());
        push(Decision::new(
            iteration,
            DecisionKind::Detail,
            target,
            format!("Implement and verify: {}", requirement),
            format!("requirement unmet after iteration {}", iteration),
        ));
    }

    for item in &feedback.blocked_items {
        let constrained_before = history
            .iter()
            .any(|d| d.kind == DecisionKind::Constrain && d.target == item.key && d.iteration < iteration);
        if constrained_before {
            push(Decision::new(
                iteration,
                DecisionKind::Descope,
                item.key.as_str(),
                format!("Remove `{}` from scope: {}", item.key, item.description),
                "blocked in two iterations".to_string(),
            ));
        } else {
            push(Decision::new(
                iteration,
                DecisionKind::Constrain,
                item.key.as_str(),
                format!(
                    "Reduce `{}` to its smallest working form: {}",
                    item.key, item.description
                ),
                format!("blocked after {} cycles", item.cycles),
            ));
        }
    }

    if let Some(visual) = &feedback.visual {
        let mut text = format!(
            "Raise visual quality from {:.0} to at least {:.0}",
            visual.score, visual.threshold
        );
        if !visual.issues.is_empty() {
            text.push_str(&format!("; address: {}", visual.issues.join("; ")));
        }
        push(Decision::new(
            iteration,
            DecisionKind::Enrich,
            "visual",
            text,
            "visual score below threshold".to_string(),
        ));
    }

    out
}

/// Append the corrections section for `iteration`. `None` when the section
/// already exists or there is nothing to add.
pub fn render_patch(document: &str, iteration: u32, decisions: &[Decision]) -> Option<String> {
    let marker = iteration_marker(iteration);
    if decisions.is_empty() || document.lines().any(|l| l.trim() == marker) {
        return None;
    }
    let mut out = document.trim_end().to_string();
    out.push_str(&format!("\n\n{}\n\n", marker));
    for d in decisions {
        out.push_str(&format!("- **{}** `{}`: {}\n", d.kind, d.target, d.decision));
    }
    Some(out)
}

/// Line counts `(before, after)` when the document shrank without a
/// descope decision to account for it.
pub fn unexplained_shrinkage(
    before: &str,
    after: &str,
    decisions: &[Decision],
) -> Option<(usize, usize)> {
    let (b, a) = (line_count(before), line_count(after));
    let descoped = decisions.iter().any(|d| d.kind == DecisionKind::Descope);
    (a < b && !descoped).then_some((b, a))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSummary {
    pub decisions: Vec<Decision>,
    pub improver_used: bool,
    pub shrinkage: Option<(usize, usize)>,
}

/// Patches the requirements document on disk, optionally through an
/// external improver command.
pub struct RequirementsPatcher {
    config: Arc<Config>,
    decisions: DecisionLog,
    events: EventStream,
}

impl RequirementsPatcher {
    pub fn new(config: Arc<Config>) -> Self {
        let events = EventStream::new(&config.event_file);
        let decisions = DecisionLog::new(&config.decision_file).with_events(events.clone());
        Self {
            config,
            decisions,
            events,
        }
    }

    async fn run_improver(&self, command: &str, feedback: &Feedback, new: &[Decision]) -> bool {
        let payload = json!({ "feedback": feedback, "decisions": new });
        let config = &self.config;
        let env = [
            (
                "CRUCIBLE_REQUIREMENTS",
                config.requirements_file.display().to_string(),
            ),
            ("CRUCIBLE_ITERATION", feedback.iteration.to_string()),
        ];
        let limit = Duration::from_secs(config.settings().iteration.improver_timeout_secs);
        match run_bounded(
            command,
            &config.project_dir,
            limit,
            Some(&payload.to_string()),
            &env,
        )
        .await
        {
            Ok(out) if out.success() => true,
            Ok(out) => {
                warn!(
                    "Spec improver failed (exit {}, timed out: {}), using deterministic patch",
                    out.exit_code, out.timed_out
                );
                false
            }
            Err(e) => {
                warn!("Spec improver could not run: {:#}", e);
                false
            }
        }
    }
}

#[async_trait]
impl SpecPatcher for RequirementsPatcher {
    async fn patch(&self, iteration: u32, feedback: &Feedback) -> Result<PatchSummary> {
        let path = &self.config.requirements_file;
        let before = std::fs::read_to_string(path).unwrap_or_default();

        let new = derive_decisions(iteration, feedback);
        for decision in &new {
            self.decisions.append(decision)?;
        }

        let improver = self.config.settings().iteration.improver_cmd.trim().to_string();
        let improver_used = !improver.is_empty() && self.run_improver(&improver, feedback, &new).await;

        let current = std::fs::read_to_string(path).unwrap_or_default();
        if let Some(patched) = render_patch(&current, iteration, &new) {
            write_atomic(path, patched.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        let after = std::fs::read_to_string(path).unwrap_or_default();

        let shrinkage = unexplained_shrinkage(&before, &after, &new);
        if let Some((b, a)) = shrinkage {
            warn!(
                "Requirements shrank from {} to {} lines without a descope decision",
                b, a
            );
            self.events.record(
                kinds::SPEC_SHRINKAGE,
                json!({"iteration": iteration, "lines_before": b, "lines_after": a}),
            );
        }
        self.events.record(
            kinds::SPEC_PATCHED,
            json!({
                "iteration": iteration,
                "decisions": new.len(),
                "improver": improver_used,
                "lines_before": line_count(&before),
                "lines_after": line_count(&after),
            }),
        );
        snapshot::write_spec_diff(&self.config.iterations_dir, iteration, &before, &after)?;
        info!(
            "Iteration {}: {} new decisions applied to requirements",
            iteration,
            new.len()
        );

        Ok(PatchSummary {
            decisions: new,
            improver_used,
            shrinkage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::feedback::{BlockedItem, VisualShortfall};
    use tempfile::tempdir;

    fn blocked(key: &str) -> BlockedItem {
        BlockedItem {
            key: key.into(),
            description: "hard thing".into(),
            cycles: 5,
        }
    }

    #[test]
    fn test_derivation_rules() {
        let feedback = Feedback {
            iteration: 1,
            failing_tests: vec!["test_login".into()],
            unmet_requirements: vec!["Password reset".into()],
            blocked_items: vec![blocked("auth/2fa")],
            visual: Some(VisualShortfall {
                score: 50.0,
                threshold: 70.0,
                issues: vec![],
            }),
            ..Default::default()
        };
        let decisions = derive_decisions(1, &feedback);
        let kinds: Vec<(DecisionKind, &str)> = decisions
            .iter()
            .map(|d| (d.kind, d.target.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DecisionKind::Fix, "test_login"),
                (DecisionKind::Detail, "Password reset"),
                (DecisionKind::Constrain, "auth/2fa"),
                (DecisionKind::Enrich, "visual"),
            ]
        );
    }

    #[test]
    fn test_repeats_are_not_reissued_and_second_block_descopes() {
        let history = vec![
            Decision::new(1, DecisionKind::Fix, "test_login", "fix", "failed"),
            Decision::new(1, DecisionKind::Constrain, "auth/2fa", "shrink", "blocked"),
        ];
        let feedback = Feedback {
            iteration: 2,
            failing_tests: vec!["test_login".into(), "test_logout".into()],
            blocked_items: vec![blocked("auth/2fa")],
            history,
            ..Default::default()
        };
        let decisions = derive_decisions(2, &feedback);
        let kinds: Vec<(DecisionKind, &str)> = decisions
            .iter()
            .map(|d| (d.kind, d.target.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DecisionKind::Fix, "test_logout"),
                (DecisionKind::Descope, "auth/2fa"),
            ]
        );
    }

    #[test]
    fn test_descoped_target_is_never_re_enriched() {
        let feedback = Feedback {
            iteration: 3,
            unmet_requirements: vec!["auth/2fa".into()],
            blocked_items: vec![blocked("auth/2fa")],
            history: vec![
                Decision::new(1, DecisionKind::Constrain, "auth/2fa", "shrink", "blocked"),
                Decision::new(2, DecisionKind::Descope, "auth/2fa", "drop", "blocked twice"),
            ],
            ..Default::default()
        };
        assert!(derive_decisions(3, &feedback).is_empty());
    }

    #[test]
    fn test_endpoint_verdicts_dedupe_across_status_changes() {
        let first = Feedback {
            iteration: 1,
            failed_probes: vec!["GET /orders -> 404 (expected 200)".into()],
            unmet_requirements: vec![
                "GET /orders -> 404 (expected 200)".into(),
                "POST /cart/ -> 500 (expected 201)".into(),
            ],
            ..Default::default()
        };
        let issued = derive_decisions(1, &first);
        let kinds: Vec<(DecisionKind, &str)> = issued
            .iter()
            .map(|d| (d.kind, d.target.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DecisionKind::Fix, "GET /orders"),
                (DecisionKind::Detail, "POST /cart"),
            ]
        );

        let second = Feedback {
            iteration: 2,
            failed_probes: vec!["GET /orders -> 500 (expected 200)".into()],
            unmet_requirements: vec![
                "GET /orders -> 500 (expected 200)".into(),
                "POST /cart -> 422 (expected 201)".into(),
            ],
            history: issued,
            ..Default::default()
        };
        assert!(derive_decisions(2, &second).is_empty());
    }

    #[test]
    fn test_render_patch_is_idempotent_per_iteration() {
        let decisions = vec![Decision::new(2, DecisionKind::Fix, "test_x", "Make it pass", "r")];
        let doc = "# App\n\nDo things.\n";
        let once = render_patch(doc, 2, &decisions).unwrap();
        assert!(once.ends_with(
            "## Iteration 2 corrections (auto-generated)\n\n- **fix** `test_x`: Make it pass\n"
        ));
        assert_eq!(render_patch(&once, 2, &decisions), None);
        assert!(render_patch(&once, 3, &decisions).is_some());
        assert_eq!(render_patch(doc, 2, &[]), None);
    }

    #[test]
    fn test_shrinkage_requires_descope() {
        let fix = vec![Decision::new(1, DecisionKind::Fix, "t", "d", "r")];
        let descope = vec![Decision::new(1, DecisionKind::Descope, "t", "d", "r")];
        assert_eq!(unexplained_shrinkage("a\nb\nc\n", "a\n", &fix), Some((3, 1)));
        assert_eq!(unexplained_shrinkage("a\nb\nc\n", "a\n", &descope), None);
        assert_eq!(unexplained_shrinkage("a\n", "a\nb\n", &fix), None);
    }

    fn patcher(dir: &std::path::Path, improver: &str) -> (RequirementsPatcher, Arc<Config>) {
        let mut config = Config::with_defaults(dir);
        config.settings_mut().iteration.improver_cmd = improver.to_string();
        config.settings_mut().iteration.improver_timeout_secs = 10;
        std::fs::create_dir_all(config.requirements_file.parent().unwrap()).unwrap();
        std::fs::write(&config.requirements_file, "# App\n\nline\nline\nline\nline\nline\nline\nline\nline\n").unwrap();
        let config = Arc::new(config);
        (RequirementsPatcher::new(config.clone()), config)
    }

    fn failing_feedback() -> Feedback {
        Feedback {
            iteration: 1,
            failing_tests: vec!["test_a".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_patcher_logs_decisions_and_patches_document() {
        let dir = tempdir().unwrap();
        let (patcher, config) = patcher(dir.path(), "");

        let summary = patcher.patch(1, &failing_feedback()).await.unwrap();
        assert_eq!(summary.decisions.len(), 1);
        assert!(!summary.improver_used);

        let doc = std::fs::read_to_string(&config.requirements_file).unwrap();
        assert!(doc.contains(&iteration_marker(1)));
        let logged = DecisionLog::new(&config.decision_file).all().unwrap();
        assert_eq!(logged.len(), 1);
        let diff = std::fs::read_to_string(config.iterations_dir.join("v001/spec-diff.md")).unwrap();
        assert!(diff.contains("+ ## Iteration 1 corrections (auto-generated)"));
    }

    #[tokio::test]
    async fn test_later_invocation_adds_its_own_section() {
        let dir = tempdir().unwrap();
        let (patcher, config) = patcher(dir.path(), "");
        patcher.patch(1, &failing_feedback()).await.unwrap();

        let log = DecisionLog::new(&config.decision_file);
        let next = Feedback {
            iteration: 3,
            failing_tests: vec!["test_a".into(), "test_b".into()],
            history: log.all().unwrap(),
            ..Default::default()
        };
        let summary = patcher.patch(3, &next).await.unwrap();
        assert_eq!(summary.decisions.len(), 1);
        assert_eq!(summary.decisions[0].target, "test_b");

        let doc = std::fs::read_to_string(&config.requirements_file).unwrap();
        assert!(doc.contains(&iteration_marker(1)));
        assert!(doc.contains(&iteration_marker(3)));
        assert!(doc.contains("`test_b`"));
        assert_eq!(log.all().unwrap().len(), 2);
        assert!(config.iterations_dir.join("v003/spec-diff.md").exists());
    }

    #[tokio::test]
    async fn test_improver_shrinking_document_emits_warning_event() {
        let dir = tempdir().unwrap();
        let (patcher, config) = patcher(dir.path(), r#"cat > /dev/null; printf '# App\n' > "$CRUCIBLE_REQUIREMENTS""#);

        let summary = patcher.patch(1, &failing_feedback()).await.unwrap();
        assert!(summary.improver_used);
        assert!(summary.shrinkage.is_some());

        let events = EventStream::new(&config.event_file)
            .by_kind(kinds::SPEC_SHRINKAGE)
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_improver_falls_back() {
        let dir = tempdir().unwrap();
        let (patcher, config) = patcher(dir.path(), "exit 1");
        let summary = patcher.patch(1, &failing_feedback()).await.unwrap();
        assert!(!summary.improver_used);
        let doc = std::fs::read_to_string(&config.requirements_file).unwrap();
        assert!(doc.contains("`test_a`"));
    }
}
