use super::feedback::Feedback;
use super::patch::PatchSummary;
use super::stagnation::StagnationGuard;
use crate::events::{EventStream, kinds};
use crate::gates::GateReport;
use crate::phase::PipelineRun;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::{info, warn};

/// What one pass through the pipeline produced.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub run: PipelineRun,
    pub gates: GateReport,
    pub feedback: Feedback,
}

/// Runs the pipeline once for a given iteration number.
#[async_trait]
pub trait PipelineDriver: Send + Sync {
    async fn run_iteration(&self, iteration: u32) -> Result<IterationOutcome>;
}

/// Applies an iteration's feedback to the requirements.
#[async_trait]
pub trait SpecPatcher: Send + Sync {
    async fn patch(&self, iteration: u32, feedback: &Feedback) -> Result<PatchSummary>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GatesPassed,
    Stagnation,
    CapExhausted,
    BuildFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::GatesPassed => "gates_passed",
            StopReason::Stagnation => "stagnation",
            StopReason::CapExhausted => "cap_exhausted",
            StopReason::BuildFailed => "build_failed",
        }
    }

    /// Process exit code: 0 success, 1 unmet gates, 2 operational failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StopReason::GatesPassed => 0,
            StopReason::Stagnation | StopReason::CapExhausted => 1,
            StopReason::BuildFailed => 2,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub reason: StopReason,
    pub iterations: u32,
    pub coverage: Vec<Option<f64>>,
    pub last: Option<IterationOutcome>,
}

pub struct IterationController<'a> {
    driver: &'a dyn PipelineDriver,
    patcher: &'a dyn SpecPatcher,
    events: EventStream,
    max_iterations: u32,
    stagnation_window: usize,
    first_iteration: u32,
}

impl<'a> IterationController<'a> {
    pub fn new(
        driver: &'a dyn PipelineDriver,
        patcher: &'a dyn SpecPatcher,
        events: EventStream,
        max_iterations: u32,
        stagnation_window: usize,
    ) -> Self {
        Self {
            driver,
            patcher,
            events,
            max_iterations: max_iterations.max(1),
            stagnation_window,
            first_iteration: 1,
        }
    }

    /// Number the first iteration of this invocation `first`. Earlier
    /// invocations' snapshots and decisions keep their numbers.
    pub fn starting_at(mut self, first: u32) -> Self {
        self.first_iteration = first.max(1);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run, evaluate, and patch until a stop condition holds.
    pub async fn run(&self) -> Result<LoopSummary> {
        let mut guard = StagnationGuard::new(self.stagnation_window);
        let mut last = None;
        let mut iteration = self.first_iteration - 1;
        let mut ran = 0;

        let reason = loop {
            iteration += 1;
            ran += 1;
            self.events.record(
                kinds::ITERATION_STARTED,
                json!({"iteration": iteration, "max_iterations": self.max_iterations}),
            );
            info!("Iteration {} ({}/{})", iteration, ran, self.max_iterations);

            let outcome = self.driver.run_iteration(iteration).await?;

            if outcome.run.build_failed() {
                warn!(
                    "Iteration {}: build failed: {}",
                    iteration,
                    outcome.run.primary_failure.as_deref().unwrap_or("unknown")
                );
                last = Some(outcome);
                break StopReason::BuildFailed;
            }
            if outcome.gates.passed {
                last = Some(outcome);
                break StopReason::GatesPassed;
            }

            let stagnant = guard.record(outcome.gates.coverage());
            if stagnant {
                warn!(
                    "Coverage has not improved for {} iterations, stopping",
                    self.stagnation_window
                );
                last = Some(outcome);
                break StopReason::Stagnation;
            }
            if ran >= self.max_iterations {
                last = Some(outcome);
                break StopReason::CapExhausted;
            }

            let summary = self.patcher.patch(iteration, &outcome.feedback).await?;
            info!(
                "Iteration {}: {} gate failures, {} new decisions",
                iteration,
                outcome.gates.failures().count(),
                summary.decisions.len()
            );
            last = Some(outcome);
        };

        let mut coverage = guard.history().to_vec();
        if matches!(reason, StopReason::GatesPassed | StopReason::BuildFailed) {
            coverage.push(last.as_ref().and_then(|o| o.gates.coverage()));
        }
        self.events.record(
            kinds::ITERATION_STOPPED,
            json!({"iteration": iteration, "reason": reason.as_str()}),
        );
        info!("Stopped after {} iterations: {}", ran, reason);

        Ok(LoopSummary {
            reason,
            iterations: ran,
            coverage,
            last,
        })
    }
}
