//! Pipeline phases: the executor seam, per-phase outcomes and the
//! aggregate record of one pipeline run.

use crate::config::Config;
use crate::decisions::DecisionLog;
use crate::events::EventStream;
use crate::features::{Counts, FeatureStore};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    Skip,
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Skip => write!(f, "skip"),
            PhaseOutcome::Pass => write!(f, "pass"),
            PhaseOutcome::Warn => write!(f, "warn"),
            PhaseOutcome::Fail => write!(f, "fail"),
        }
    }
}

/// What one phase reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub outcome: PhaseOutcome,
    pub message: String,
    pub duration_secs: f64,
}

impl PhaseResult {
    pub fn new(outcome: PhaseOutcome, message: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            outcome,
            message: message.into(),
            duration_secs: 0.0,
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self::new(PhaseOutcome::Skip, message)
    }

    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(PhaseOutcome::Pass, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(PhaseOutcome::Warn, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(PhaseOutcome::Fail, message)
    }
}

/// Everything a phase may read or write.
#[derive(Clone)]
pub struct PhaseContext {
    pub config: Arc<Config>,
    pub events: EventStream,
    pub store: FeatureStore,
    pub decisions: DecisionLog,
    /// 1-based iteration of the autonomous loop (1 for a single run)
    pub iteration: u32,
}

impl PhaseContext {
    pub fn new(config: Arc<Config>, iteration: u32) -> Self {
        let events = EventStream::new(&config.event_file);
        let store = FeatureStore::new(
            &config.groups_dir,
            config.settings().build.max_cycles_per_feature,
        )
        .with_events(events.clone());
        let decisions = DecisionLog::new(&config.decision_file).with_events(events.clone());
        Self {
            config,
            events,
            store,
            decisions,
            iteration,
        }
    }
}

/// One step of the pipeline.
///
/// Executors wrap a single external check or tool. `Ok` results carry the
/// outcome; `Err` means the phase could not run at all and is reported as a
/// failure by the runner.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Only a blocking phase's failure becomes the run's primary failure.
    fn blocking(&self) -> bool {
        false
    }

    /// Bound enforced by the runner. `None` for phases that police
    /// themselves (the build phase has its own monitor).
    fn timeout(&self) -> Option<Duration>;

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult>;
}

/// Aggregate of one pass through the phase list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRun {
    pub iteration: u32,
    pub phases: Vec<PhaseResult>,
    /// Index of the phase currently executing (== `phases.len()` when done)
    pub current: usize,
    /// Set only by a blocking phase.
    pub primary_failure: Option<String>,
    pub items_total: usize,
    pub items_passed: usize,
    pub items_blocked: usize,
}

impl PipelineRun {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            ..Default::default()
        }
    }

    pub fn record(&mut self, result: PhaseResult) {
        self.phases.push(result);
        self.current = self.phases.len();
    }

    pub fn count(&self, outcome: PhaseOutcome) -> usize {
        self.phases.iter().filter(|p| p.outcome == outcome).count()
    }

    pub fn set_item_counts(&mut self, counts: &Counts) {
        self.items_total = counts.total;
        self.items_passed = counts.passed;
        self.items_blocked = counts.blocked;
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn build_failed(&self) -> bool {
        self.primary_failure.is_some()
    }
}
