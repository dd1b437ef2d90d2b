//! Ordered execution of pipeline phases.
//!
//! | Phase          | Module           | Blocking | Report written            |
//! |----------------|------------------|----------|---------------------------|
//! | `spec-review`  | `spec_review`    | no       | `spec-enrichment.json`    |
//! | `context`      | `context`        | no       | (instruction file)        |
//! | `build`        | `build`          | yes      | (work-item documents)     |
//! | `tests`        | `project_tests`  | no       | `test-results.json`       |
//! | `outcome`      | `tools`          | no       | `outcome-report.json`     |
//! | `smoke`        | `tools`          | no       | `smoke-test.json`         |
//! | `visual`       | `tools`          | no       | `visual-eval.json`        |
//! | `probes`       | `tools`          | no       | `runtime-trace.json`      |
//! | `learnings`    | `tools`          | no       | (learnings file)          |
//! | `build-record` | `record`         | no       | `logs/build-commits.log`  |

pub mod build;
pub mod context;
pub mod driver;
pub mod process;
pub mod project_tests;
pub mod record;
pub mod spec_review;
pub mod tools;

use crate::events::kinds;
use crate::phase::{PhaseContext, PhaseExecutor, PhaseOutcome, PhaseResult, PipelineRun};
use crate::ui::{BuildProgress, PipelineUI};
use serde_json::json;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct PipelineRunner {
    phases: Vec<Box<dyn PhaseExecutor>>,
}

impl PipelineRunner {
    pub fn new(phases: Vec<Box<dyn PhaseExecutor>>) -> Self {
        Self { phases }
    }

    /// The built-in phase list, configured from `ctx.config`.
    pub fn standard(ctx: &PhaseContext, progress: Option<BuildProgress>) -> Self {
        let config = &ctx.config;
        let settings = config.settings();
        let t = &settings.timeouts;
        let tools = &settings.tools;
        Self::new(vec![
            Box::new(spec_review::SpecReviewPhase::new(
                &tools.spec_review,
                t.spec_review,
            )),
            Box::new(context::ContextPhase::new(t.context)),
            Box::new(build::BuildPhase::new(progress)),
            Box::new(project_tests::ProjectTestsPhase::new(&tools.tests, t.tests)),
            Box::new(tools::ToolPhase::new(
                "outcome",
                &tools.outcome,
                t.outcome,
                Some(crate::gates::reports::OUTCOME_REPORT),
            )),
            Box::new(tools::ToolPhase::new(
                "smoke",
                &tools.smoke,
                t.smoke,
                Some(crate::gates::reports::SMOKE_REPORT),
            )),
            Box::new(tools::ToolPhase::new(
                "visual",
                &tools.visual,
                t.visual,
                Some(crate::gates::reports::VISUAL_REPORT),
            )),
            Box::new(tools::ToolPhase::new(
                "probes",
                &tools.probes,
                t.probes,
                Some(crate::gates::reports::PROBE_REPORT),
            )),
            Box::new(tools::ToolPhase::new(
                "learnings",
                &tools.learnings,
                t.learnings,
                None,
            )),
            Box::new(record::BuildRecordPhase::new(t.build_record)),
        ])
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase in order.
    ///
    /// A non-blocking phase that fails, errors or times out is recorded and
    /// the run continues. A blocking phase's failure sets the primary
    /// failure and stops progression (later phases are not run).
    pub async fn run(&self, ctx: &PhaseContext, ui: Option<&PipelineUI>) -> PipelineRun {
        let mut run = PipelineRun::new(ctx.iteration);

        for phase in &self.phases {
            let name = phase.name().to_string();
            if let Some(ui) = ui {
                ui.start_phase(&name);
            }
            ctx.events.record(
                kinds::PHASE_STARTED,
                json!({"phase": name, "iteration": ctx.iteration}),
            );
            let started = Instant::now();

            let outcome = match phase.timeout() {
                Some(limit) => match timeout(limit, phase.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Ok(PhaseResult::fail(format!(
                        "timed out after {}s",
                        limit.as_secs()
                    ))),
                },
                None => phase.execute(ctx).await,
            };
            let mut result = match outcome {
                Ok(result) => result,
                Err(e) => PhaseResult::fail(format!("{:#}", e)),
            };
            result.name = name.clone();
            result.duration_secs = started.elapsed().as_secs_f64();

            match result.outcome {
                PhaseOutcome::Fail => warn!(phase = %name, "phase failed: {}", result.message),
                _ => info!(phase = %name, outcome = %result.outcome, "{}", result.message),
            }
            ctx.events.record(
                kinds::PHASE_COMPLETED,
                json!({
                    "phase": name,
                    "iteration": ctx.iteration,
                    "outcome": result.outcome,
                    "message": result.message,
                    "duration_secs": result.duration_secs,
                }),
            );
            if let Some(ui) = ui {
                ui.phase_complete(&result);
            }

            let stop = phase.blocking() && result.outcome == PhaseOutcome::Fail;
            if stop {
                run.primary_failure = Some(format!("{}: {}", name, result.message));
            }
            run.record(result);
            if stop {
                break;
            }
        }

        run.set_item_counts(&ctx.store.snapshot().counts);
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Scripted {
        name: &'static str,
        blocking: bool,
        delay: Duration,
        result: fn() -> Result<PhaseResult>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PhaseExecutor for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn blocking(&self) -> bool {
            self.blocking
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(200))
        }

        async fn execute(&self, _ctx: &PhaseContext) -> Result<PhaseResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.result)()
        }
    }

    fn scripted(
        name: &'static str,
        blocking: bool,
        delay_ms: u64,
        result: fn() -> Result<PhaseResult>,
        calls: &Arc<AtomicUsize>,
    ) -> Box<dyn PhaseExecutor> {
        Box::new(Scripted {
            name,
            blocking,
            delay: Duration::from_millis(delay_ms),
            result,
            calls: calls.clone(),
        })
    }

    fn ctx(dir: &std::path::Path) -> PhaseContext {
        PhaseContext::new(Arc::new(Config::with_defaults(dir)), 1)
    }

    #[tokio::test]
    async fn test_non_blocking_failures_do_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = PipelineRunner::new(vec![
            scripted("a", false, 0, || Ok(PhaseResult::fail("broken")), &calls),
            scripted("b", false, 0, || anyhow::bail!("could not start"), &calls),
            scripted("c", false, 1_000, || Ok(PhaseResult::pass("late")), &calls),
            scripted("d", false, 0, || Ok(PhaseResult::pass("ok")), &calls),
        ]);

        let run = runner.run(&ctx(dir.path()), None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(run.phases.len(), 4);
        assert_eq!(run.count(PhaseOutcome::Fail), 3);
        assert!(run.phase("b").unwrap().message.contains("could not start"));
        assert!(run.phase("c").unwrap().message.contains("timed out"));
        assert_eq!(run.phase("d").unwrap().outcome, PhaseOutcome::Pass);
        assert!(!run.build_failed());
    }

    #[tokio::test]
    async fn test_blocking_failure_sets_primary_and_stops() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = PipelineRunner::new(vec![
            scripted("prep", false, 0, || Ok(PhaseResult::warn("meh")), &calls),
            scripted("build", true, 0, || Ok(PhaseResult::fail("agent crashed")), &calls),
            scripted("after", false, 0, || Ok(PhaseResult::pass("ok")), &calls),
        ]);

        let run = runner.run(&ctx(dir.path()), None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            run.primary_failure.as_deref(),
            Some("build: agent crashed")
        );
        assert!(run.phase("after").is_none());
    }

    #[tokio::test]
    async fn test_phase_events_are_emitted_in_order() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = PipelineRunner::new(vec![
            scripted("one", false, 0, || Ok(PhaseResult::skip("n/a")), &calls),
            scripted("two", false, 0, || Ok(PhaseResult::pass("ok")), &calls),
        ]);
        let ctx = ctx(dir.path());
        runner.run(&ctx, None).await;

        let events = ctx.events.read_all().unwrap();
        let trail: Vec<(String, String)> = events
            .iter()
            .map(|e| (e.kind.clone(), e.data["phase"].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(
            trail,
            vec![
                (kinds::PHASE_STARTED.to_string(), "one".to_string()),
                (kinds::PHASE_COMPLETED.to_string(), "one".to_string()),
                (kinds::PHASE_STARTED.to_string(), "two".to_string()),
                (kinds::PHASE_COMPLETED.to_string(), "two".to_string()),
            ]
        );
        assert_eq!(events[1].data["outcome"], "skip");
    }

    #[test]
    fn test_standard_phase_order() {
        let dir = tempdir().unwrap();
        let runner = PipelineRunner::standard(&ctx(dir.path()), None);
        assert_eq!(
            runner.names(),
            vec![
                "spec-review",
                "context",
                "build",
                "tests",
                "outcome",
                "smoke",
                "visual",
                "probes",
                "learnings",
                "build-record"
            ]
        );
    }
}
