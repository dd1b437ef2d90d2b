//! Work-item progress and runner state: `crucible status`.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use super::CrucibleExit;

pub fn cmd_status(project_dir: PathBuf) -> Result<CrucibleExit> {
    use crucible::audit::AuditLogger;
    use crucible::config::{CliOverrides, Config};
    use crucible::features::{FeatureStore, ItemStatus};
    use crucible::lock::{ProcessLock, pid_alive};
    use crucible::ui::icons::{BLOCKER, CHECK, CROSS, PENDING, PROGRESS};

    let config = Config::new(project_dir, false, &CliOverrides::default())?;
    let store = FeatureStore::new(
        &config.groups_dir,
        config.settings().build.max_cycles_per_feature,
    );
    let snapshot = store.snapshot();

    println!();
    println!("{}", style("Crucible Status").bold());
    println!("===============");

    let lock = ProcessLock::new(&config.lock_file);
    let running = match lock.holder() {
        Some(pid) if pid_alive(pid) => {
            println!("Runner: active (pid {})", pid);
            true
        }
        Some(pid) => {
            println!("Runner: idle (stale lock from pid {})", pid);
            false
        }
        None => {
            println!("Runner: idle");
            false
        }
    };

    if snapshot.items.is_empty() {
        println!();
        println!("No work items under {}", config.groups_dir.display());
    }

    for group in snapshot.groups() {
        println!();
        println!("{}", style(&group).cyan().bold());
        for item in snapshot.items.iter().filter(|i| i.group == group) {
            let icon = match item.status {
                ItemStatus::Passed => CHECK,
                ItemStatus::Blocked => BLOCKER,
                ItemStatus::Failed => CROSS,
                ItemStatus::Pending => PENDING,
            };
            println!(
                "  {}{:<24} {:<8} {}",
                icon,
                item.id,
                item.status,
                style(format!("{} cycles", item.cycles)).dim()
            );
        }
    }

    let c = snapshot.counts;
    println!();
    println!(
        "{}Progress: {}/{} features passed ({:.0}% resolved) | {} blocked | {} remaining",
        PROGRESS,
        c.passed,
        c.total,
        c.resolved_pct(),
        c.blocked,
        c.remaining()
    );

    let mut audit = AuditLogger::new(&config.audit_dir);
    if audit.load_current()?
        && let Some(run) = audit.current_run()
    {
        let label = if running { "Current run" } else { "Interrupted run" };
        println!(
            "{}: started {} ({} iterations recorded)",
            label,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.iterations.len()
        );
    }
    if let Some(latest) = audit.list_runs()?.first() {
        let run = audit.load_run(latest)?;
        println!(
            "Last run: {} ({} iterations, stopped: {})",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.iterations.len(),
            run.stop_reason.as_deref().unwrap_or("unknown")
        );
    }
    println!();

    Ok(CrucibleExit::Success)
}
