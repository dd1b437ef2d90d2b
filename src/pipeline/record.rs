//! Build record: the project's recent git history, plus the per-run
//! changelog under `.crucible/iterations/`.

use crate::gates::GateReport;
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult, PipelineRun};
use crate::tracker::GitTracker;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const COMMIT_LOG: &str = "build-commits.log";
const COMMIT_LIMIT: usize = 20;

static PASSED_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)/(\d+) passed").unwrap());

pub struct BuildRecordPhase {
    timeout: Duration,
}

impl BuildRecordPhase {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PhaseExecutor for BuildRecordPhase {
    fn name(&self) -> &str {
        "build-record"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        let config = &ctx.config;
        let Ok(tracker) = GitTracker::new(&config.project_dir) else {
            return Ok(PhaseResult::skip("not a git repository"));
        };

        let commits = tracker.recent_commits(COMMIT_LIMIT)?;
        let uncommitted = tracker.uncommitted_paths()?;

        let mut log = String::new();
        for commit in &commits {
            log.push_str(&commit.log_line());
            log.push('\n');
        }
        if !uncommitted.is_empty() {
            log.push_str(&format!("\n{} uncommitted paths:\n", uncommitted.len()));
            for path in &uncommitted {
                log.push_str(&format!("  {}\n", path.display()));
            }
        }

        let path = config.log_dir.join(COMMIT_LOG);
        write_atomic(&path, log.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(PhaseResult::pass(format!(
            "{} commits, {} uncommitted paths",
            commits.len(),
            uncommitted.len()
        )))
    }
}

fn existing_runs(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("run-*.md");
    let mut runs: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map(|paths| paths.filter_map(|p| p.ok()).collect())
        .unwrap_or_default();
    runs.sort_by_key(|p| run_number(p).unwrap_or(0));
    runs
}

fn run_number(path: &Path) -> Option<u32> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("run-")?
        .parse()
        .ok()
}

/// Write `run-<N>.md` for a finished run, numbering after the existing
/// changelogs. Returns the path written.
pub fn write_changelog(
    iterations_dir: &Path,
    run: &PipelineRun,
    gates: Option<&GateReport>,
) -> Result<PathBuf> {
    let existing = existing_runs(iterations_dir);
    let number = existing
        .last()
        .and_then(|p| run_number(p))
        .map(|n| n + 1)
        .unwrap_or(1);

    let total_secs: f64 = run.phases.iter().map(|p| p.duration_secs).sum();
    let build_secs = run.phase("build").map(|p| p.duration_secs).unwrap_or(0.0);
    let failed = run
        .items_total
        .saturating_sub(run.items_passed + run.items_blocked);
    let pct = if run.items_total > 0 {
        run.items_passed * 100 / run.items_total
    } else {
        0
    };

    let mut lines = vec![
        format!("# Run #{}", number),
        String::new(),
        format!("- **Timestamp:** {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
        format!("- **Iteration:** {}", run.iteration),
        format!("- **Duration:** {:.0}s", total_secs),
        format!("- **Build time:** {:.0}s", build_secs),
        format!(
            "- **Features:** {}/{} passed, {} failed, {} blocked",
            run.items_passed, run.items_total, failed, run.items_blocked
        ),
        format!("- **Pass rate:** {}%", pct),
    ];

    if let Some(previous) = existing.last()
        && let Ok(text) = std::fs::read_to_string(previous)
        && let Some(caps) = PASSED_LINE_REGEX.captures(&text)
        && let Ok(prev_passed) = caps[1].parse::<i64>()
    {
        lines.push(format!(
            "- **Delta:** {:+} features vs run #{}",
            run.items_passed as i64 - prev_passed,
            number - 1
        ));
    }
    if let Some(coverage) = gates.and_then(|g| g.coverage()) {
        lines.push(format!("- **Outcome coverage:** {:.0}%", coverage));
    }
    if let Some(reason) = &run.primary_failure {
        lines.push(format!("- **Primary failure:** {}", reason));
    }

    lines.push(String::new());
    lines.push("| Phase | Outcome | Duration | Message |".to_string());
    lines.push("|-------|---------|----------|---------|".to_string());
    for phase in &run.phases {
        lines.push(format!(
            "| {} | {} | {:.1}s | {} |",
            phase.name,
            phase.outcome,
            phase.duration_secs,
            phase.message.replace('|', "\\|")
        ));
    }

    let path = iterations_dir.join(format!("run-{}.md", number));
    write_atomic(&path, (lines.join("\n") + "\n").as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
