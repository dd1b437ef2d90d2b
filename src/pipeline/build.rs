//! The build phase: one long-running agent subprocess watched by the
//! progress monitor.

use super::process::terminate_group;
use crate::errors::PipelineError;
use crate::monitor::{MonitorReport, MonitorSettings, spawn_monitor};
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult};
use crate::ui::BuildProgress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BuildPhase {
    progress: Option<BuildProgress>,
}

impl BuildPhase {
    pub fn new(progress: Option<BuildProgress>) -> Self {
        Self { progress }
    }
}

#[async_trait]
impl PhaseExecutor for BuildPhase {
    fn name(&self) -> &str {
        "build"
    }

    fn blocking(&self) -> bool {
        true
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        let config = &ctx.config;
        let build = &config.settings().build;

        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let log_path = config.log_dir.join(format!("agent-{}.log", ctx.iteration));
        let log = File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?;
        let log_err = log.try_clone().context("Failed to clone agent log handle")?;

        let mut cmd = Command::new(&build.agent_cmd);
        cmd.args(&build.agent_args)
            .arg(&build.instruction)
            .current_dir(&config.project_dir)
            .env("CRUCIBLE_DIR", &config.crucible_dir)
            .env("CRUCIBLE_GROUPS", &config.groups_dir)
            .env("CRUCIBLE_ITERATION", ctx.iteration.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(true);

        info!(agent = %build.agent_cmd, "Starting agent");
        let mut child = cmd.spawn().map_err(|source| PipelineError::AgentSpawn {
            cmd: build.agent_cmd.clone(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let settings = MonitorSettings::from_build(build);
        let progress = self.progress.clone();
        let monitor = spawn_monitor(
            ctx.store.clone(),
            ctx.events.clone(),
            settings,
            cancel.clone(),
            done.clone(),
            progress.clone(),
        );

        let started = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let waited = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = cancel.cancelled() => break None,
                _ = tick.tick() => {
                    if let Some(p) = &progress {
                        p.elapsed(started.elapsed());
                    }
                }
            }
        };

        let grace = Duration::from_secs(build.kill_grace_secs);
        let report = settle(&mut child, &waited, grace, &done, monitor).await;
        if let Some(p) = &progress {
            p.finish();
        }
        let exit = waited.transpose().context("Failed to wait for agent")?;

        let counts = ctx.store.snapshot().counts;
        let summary = format!(
            "{}/{} passed, {} blocked",
            counts.passed, counts.total, counts.blocked
        );

        match exit {
            None => {
                let reason = report
                    .cancel_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "cancelled".to_string());
                Ok(PhaseResult::fail(format!("timeout: {} ({})", reason, summary)))
            }
            Some(status) if !status.success() => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                warn!("Agent exited with {}, see {}", code, log_path.display());
                Ok(PhaseResult::fail(format!(
                    "agent exited with {} ({})",
                    code, summary
                )))
            }
            Some(_) => {
                let mut message = summary;
                if !report.forced.is_empty() {
                    message.push_str(&format!(", {} force-advanced", report.forced.len()));
                }
                Ok(PhaseResult::pass(message))
            }
        }
    }
}

/// Stop the agent's process group unless it exited on its own, then wind
/// down the monitor.
async fn settle(
    child: &mut Child,
    waited: &Option<std::io::Result<ExitStatus>>,
    grace: Duration,
    done: &CancellationToken,
    monitor: JoinHandle<MonitorReport>,
) -> MonitorReport {
    if !matches!(waited, Some(Ok(_))) {
        terminate_group(child, grace).await;
    }
    done.cancel();
    monitor.await.unwrap_or_default()
}
