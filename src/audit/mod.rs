use crate::features::Counts;
use crate::gates::{GateReport, Thresholds};
use crate::phase::{PhaseOutcome, PhaseResult, PipelineRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Machine-readable record of one `crucible run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub iterations: Vec<IterationAudit>,
    /// Why the loop stopped, once it has
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl AuditRun {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            iterations: Vec::new(),
            stop_reason: None,
        }
    }

    pub fn finish(&mut self, stop_reason: Option<String>) {
        self.ended_at = Some(Utc::now());
        self.stop_reason = stop_reason;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    pub agent_cmd: String,
    pub max_iterations: u32,
    pub thresholds: Thresholds,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationAudit {
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub phases: Vec<PhaseResult>,
    pub primary_failure: Option<String>,
    pub items: Counts,
    pub gates: GateReport,
    /// HEAD of the project repository after the build, when it is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
}

impl IterationAudit {
    pub fn new(run: &PipelineRun, items: Counts, gates: GateReport) -> Self {
        Self {
            iteration: run.iteration,
            recorded_at: Utc::now(),
            duration_secs: run.phases.iter().map(|p| p.duration_secs).sum(),
            phases: run.phases.clone(),
            primary_failure: run.primary_failure.clone(),
            items,
            gates,
            head_sha: None,
        }
    }

    pub fn count(&self, outcome: PhaseOutcome) -> usize {
        self.phases.iter().filter(|p| p.outcome == outcome).count()
    }
}

pub mod logger;
pub use logger::AuditLogger;
