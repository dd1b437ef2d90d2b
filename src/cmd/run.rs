//! The pipeline and the autonomous loop: `crucible run`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::CrucibleExit;

pub struct RunArgs {
    pub looped: bool,
    pub max_iterations: Option<u32>,
    pub coverage: Option<f64>,
}

pub async fn cmd_run(project_dir: PathBuf, verbose: bool, args: RunArgs) -> Result<CrucibleExit> {
    use crucible::audit::{AuditLogger, RunConfig};
    use crucible::config::{CliOverrides, Config};
    use crucible::decisions::DecisionLog;
    use crucible::events::EventStream;
    use crucible::gates::Thresholds;
    use crucible::iteration::{IterationController, RequirementsPatcher, snapshot};
    use crucible::lock::ProcessLock;
    use crucible::phase::PhaseContext;
    use crucible::pipeline::PipelineRunner;
    use crucible::pipeline::driver::LiveDriver;
    use crucible::ui::PipelineUI;
    use crucible::ui::icons::{CROSS, SPARKLE, WARN};
    use tracing::warn;

    // A plain run is a loop of one.
    let overrides = CliOverrides {
        max_iterations: if args.looped {
            args.max_iterations
        } else {
            Some(1)
        },
        coverage: args.coverage,
    };
    let config = Config::new(project_dir, verbose, &overrides)?;
    for warning in &config.warnings {
        warn!("{}", warning);
    }
    config.ensure_directories()?;

    let _lock = ProcessLock::new(&config.lock_file).guard()?;

    let config = Arc::new(config);
    let settings = config.settings();
    let max_iterations = settings.iteration.max_iterations.max(1);
    // Numbering continues after earlier invocations' decisions and snapshots.
    let first_iteration = DecisionLog::new(&config.decision_file)
        .last_iteration()?
        .max(snapshot::latest_iteration(&config.iterations_dir))
        .map_or(1, |n| n + 1);
    let phase_count = PipelineRunner::standard(&PhaseContext::new(config.clone(), 1), None).len();
    let ui = Arc::new(PipelineUI::new(phase_count as u64, verbose));

    let mut audit = AuditLogger::new(&config.audit_dir);
    audit.start_run(RunConfig {
        project_dir: config.project_dir.clone(),
        agent_cmd: settings.build.agent_cmd.clone(),
        max_iterations,
        thresholds: Thresholds::from(&settings.quality),
        verbose,
    })?;

    let patcher = RequirementsPatcher::new(config.clone());
    let events = EventStream::new(&config.event_file);
    let last_iteration = first_iteration + max_iterations - 1;
    let driver = LiveDriver::new(config.clone(), Some(ui.clone()), audit, last_iteration);

    let result = IterationController::new(
        &driver,
        &patcher,
        events,
        max_iterations,
        settings.iteration.stagnation_window,
    )
    .starting_at(first_iteration)
    .run()
    .await;
    ui.finish();

    let mut audit = driver.into_audit();
    let stop = match &result {
        Ok(summary) => summary.reason.to_string(),
        Err(_) => "error".to_string(),
    };
    let run_file = audit.finish_run(Some(stop))?;
    let summary = result?;

    println!();
    if let Some(last) = &summary.last {
        super::gates::print_report(&last.gates);
        if let Some(reason) = &last.run.primary_failure {
            println!("{} Build failed: {}", CROSS, reason);
        }
    }
    let icon = match summary.reason.exit_code() {
        0 => SPARKLE,
        _ => WARN,
    };
    println!(
        "{} Stopped after {} iteration(s): {}",
        icon,
        summary.iterations,
        console::style(summary.reason).bold()
    );
    println!("  Run record: {}", run_file.display());

    Ok(summary.reason.into())
}
