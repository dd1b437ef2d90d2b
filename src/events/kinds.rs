//! Event type names written to the stream.

pub const FEATURE_FAILED: &str = "feature.failed";
pub const FEATURE_BLOCKED: &str = "feature.blocked";
pub const FEATURE_PASSED: &str = "feature.passed";
pub const FEATURE_STALLED: &str = "feature.stalled";
pub const FEATURE_STALL_WARNING: &str = "feature.stall_warning";
pub const FEATURE_ATTEMPT_IGNORED: &str = "feature.attempt_ignored";
pub const FEATURE_PASS_REJECTED: &str = "feature.pass_rejected";

pub const PHASE_STARTED: &str = "phase.started";
pub const PHASE_COMPLETED: &str = "phase.completed";

pub const BUILD_TIMEOUT: &str = "build.timeout";

pub const GATES_EVALUATED: &str = "gates.evaluated";

pub const DECISION_LOGGED: &str = "decision.logged";
pub const SPEC_PATCHED: &str = "spec.patched";
pub const SPEC_SHRINKAGE: &str = "spec.shrinkage";

pub const ITERATION_STARTED: &str = "iteration.started";
pub const ITERATION_STOPPED: &str = "iteration.stopped";
