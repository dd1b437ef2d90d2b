//! Optional external evaluation tools.
//!
//! Each tool is a shell command that writes its report under `.crucible/`.
//! The gate evaluator reads the reports later; this phase only checks that
//! the tool ran and left its report behind.

use super::process::run_bounded;
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult};
use crate::util::truncate_chars;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub struct ToolPhase {
    name: &'static str,
    command: String,
    timeout: Duration,
    report: Option<&'static str>,
}

impl ToolPhase {
    pub fn new(
        name: &'static str,
        command: &str,
        timeout_secs: u64,
        report: Option<&'static str>,
    ) -> Self {
        Self {
            name,
            command: command.trim().to_string(),
            timeout: Duration::from_secs(timeout_secs),
            report,
        }
    }
}

#[async_trait]
impl PhaseExecutor for ToolPhase {
    fn name(&self) -> &str {
        self.name
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout + Duration::from_secs(5))
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        if self.command.is_empty() {
            return Ok(PhaseResult::skip("not configured"));
        }
        let config = &ctx.config;

        // A stale report from an earlier iteration must not be evaluated.
        let report_path = self.report.map(|name| config.report_path(name));
        if let Some(path) = &report_path
            && path.exists()
        {
            std::fs::remove_file(path)?;
        }

        let mut env = vec![
            ("CRUCIBLE_DIR", config.crucible_dir.display().to_string()),
            ("CRUCIBLE_ITERATION", ctx.iteration.to_string()),
            (
                "CRUCIBLE_REQUIREMENTS",
                config.requirements_file.display().to_string(),
            ),
        ];
        if let Some(path) = &report_path {
            env.push(("CRUCIBLE_REPORT", path.display().to_string()));
        }

        let out = run_bounded(
            &self.command,
            &config.project_dir,
            self.timeout,
            None,
            &env,
        )
        .await?;

        if out.timed_out {
            return Ok(PhaseResult::fail(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        if out.exit_code != 0 {
            let detail = out.stderr.trim();
            return Ok(PhaseResult::fail(if detail.is_empty() {
                format!("exited with code {}", out.exit_code)
            } else {
                format!(
                    "exited with code {}: {}",
                    out.exit_code,
                    truncate_chars(detail, 200)
                )
            }));
        }
        match (self.report, &report_path) {
            (Some(name), Some(path)) if !path.exists() => {
                Ok(PhaseResult::warn(format!("completed without writing {}", name)))
            }
            (Some(name), _) => Ok(PhaseResult::pass(format!("wrote {}", name))),
            _ => Ok(PhaseResult::pass("completed")),
        }
    }
}
