//! The live pipeline driver used by `crucible run`.

use super::PipelineRunner;
use super::record::write_changelog;
use crate::audit::{AuditLogger, IterationAudit};
use crate::config::Config;
use crate::events::kinds;
use crate::gates::reports::Reports;
use crate::gates::{self, Thresholds, ground_truth};
use crate::iteration::snapshot::write_snapshot;
use crate::iteration::{Feedback, IterationOutcome, PipelineDriver};
use crate::phase::PhaseContext;
use crate::tracker::GitTracker;
use crate::ui::PipelineUI;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub struct LiveDriver {
    config: Arc<Config>,
    ui: Option<Arc<PipelineUI>>,
    audit: Mutex<AuditLogger>,
    last_iteration: u32,
}

impl LiveDriver {
    /// `audit` must already have an active run. `last_iteration` is the
    /// number this invocation stops at, for the progress header.
    pub fn new(
        config: Arc<Config>,
        ui: Option<Arc<PipelineUI>>,
        audit: AuditLogger,
        last_iteration: u32,
    ) -> Self {
        Self {
            config,
            ui,
            audit: Mutex::new(audit),
            last_iteration,
        }
    }

    pub fn into_audit(self) -> AuditLogger {
        self.audit.into_inner()
    }
}

#[async_trait]
impl PipelineDriver for LiveDriver {
    async fn run_iteration(&self, iteration: u32) -> Result<IterationOutcome> {
        let config = &self.config;
        let ctx = PhaseContext::new(config.clone(), iteration);
        let ui = self.ui.as_deref();
        if let Some(ui) = ui {
            ui.iteration_header(iteration, self.last_iteration);
        }

        let runner = PipelineRunner::standard(&ctx, ui.map(|ui| ui.build_progress()));
        let run = runner.run(&ctx, ui).await;

        if let Err(e) = ground_truth::apply(&config.crucible_dir) {
            warn!("Could not reconcile outcome report with probes: {:#}", e);
        }
        let reports = Reports::load(&config.crucible_dir);
        for name in &reports.unreadable {
            warn!("Ignoring unreadable report {}", name);
        }
        let snapshot = ctx.store.snapshot();
        let thresholds = Thresholds::from(&config.settings().quality);
        let gates = gates::evaluate(&reports, &snapshot.counts, &thresholds);
        ctx.events.record(
            kinds::GATES_EVALUATED,
            json!({
                "iteration": iteration,
                "passed": gates.passed,
                "completeness": gates.completeness,
                "failed": gates.failures().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            }),
        );

        let mut entry = IterationAudit::new(&run, snapshot.counts, gates.clone());
        entry.head_sha = GitTracker::new(&config.project_dir)
            .ok()
            .and_then(|tracker| tracker.head_sha());
        self.audit.lock().await.add_iteration(entry)?;

        write_changelog(&config.iterations_dir, &run, Some(&gates))?;

        let feedback = Feedback::synthesize(
            iteration,
            run.primary_failure.clone(),
            &gates,
            &reports,
            &snapshot,
            ctx.decisions.all()?,
        );
        let requirements = std::fs::read_to_string(&config.requirements_file).unwrap_or_default();
        write_snapshot(
            &config.iterations_dir,
            iteration,
            &snapshot.counts,
            &gates,
            &feedback,
            &requirements,
        )?;

        Ok(IterationOutcome {
            run,
            gates,
            feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RunConfig;
    use crate::iteration::snapshot::read_manifest;
    use crate::phase::PhaseOutcome;
    use tempfile::tempdir;

    fn driver(dir: &std::path::Path, agent: &str) -> LiveDriver {
        let mut config = Config::with_defaults(dir);
        config.settings_mut().build.agent_cmd = agent.to_string();
        config.ensure_directories().unwrap();
        let config = Arc::new(config);
        let mut audit = AuditLogger::new(&config.audit_dir);
        audit
            .start_run(RunConfig {
                project_dir: dir.to_path_buf(),
                agent_cmd: agent.to_string(),
                max_iterations: 1,
                thresholds: Thresholds::default(),
                verbose: false,
            })
            .unwrap();
        LiveDriver::new(config, None, audit, 1)
    }

    #[tokio::test]
    async fn test_iteration_records_everything() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path(), "true");

        let outcome = driver.run_iteration(1).await.unwrap();
        assert_eq!(
            outcome.run.phase("build").unwrap().outcome,
            PhaseOutcome::Pass
        );
        assert!(outcome.gates.passed);
        assert!(outcome.feedback.is_empty());

        let crucible = dir.path().join(".crucible");
        assert!(crucible.join("iterations/run-1.md").exists());
        assert!(read_manifest(&crucible.join("iterations"), 1).unwrap().gates_passed);

        let audit = driver.into_audit();
        assert_eq!(audit.current_run().unwrap().iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_agent_is_a_build_failure() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path(), "/nonexistent/agent-binary");

        let outcome = driver.run_iteration(1).await.unwrap();
        assert!(outcome.run.build_failed());
        assert_eq!(outcome.run.phases.last().unwrap().name, "build");
        assert!(
            outcome
                .feedback
                .primary_failure
                .as_deref()
                .unwrap()
                .contains("/nonexistent/agent-binary")
        );
    }
}
