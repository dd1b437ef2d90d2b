//! Requirements review: an optional external reviewer proposes enrichment
//! items and assumptions, which are appended to the requirements document
//! exactly once under a marker heading.

use super::process::run_bounded;
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult};
use crate::util::{extract_json_object, write_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const ENRICHMENT_MARKER: &str = "## Additional Specifications (auto-generated)";

/// File the reviewer may write instead of printing JSON.
pub const ENRICHMENT_FILE: &str = "spec-enrichment.json";

/// Beyond this many items the remainder is folded into one paragraph.
const MAX_ENRICHMENT_BULLETS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default)]
    pub enrichment: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.enrichment.is_empty() && self.assumptions.is_empty()
    }
}

/// Append the enrichment section. Returns `None` when the document already
/// carries the marker or there is nothing to add.
pub fn apply_enrichment(document: &str, enrichment: &Enrichment) -> Option<String> {
    if document.contains(ENRICHMENT_MARKER) || enrichment.is_empty() {
        return None;
    }

    let mut block = format!("\n\n{}\n\n", ENRICHMENT_MARKER);
    let items = &enrichment.enrichment;
    let (bullets, rest) = items.split_at(items.len().min(MAX_ENRICHMENT_BULLETS));
    for item in bullets {
        block.push_str(&format!("- {}\n", item));
    }
    if !rest.is_empty() {
        block.push_str(&format!(
            "\nAdditionally, identified {} minor specifications: {}.\n",
            rest.len(),
            rest.join("; ")
        ));
    }
    if !enrichment.assumptions.is_empty() {
        block.push_str("\n### Assumptions\n\n");
        for a in &enrichment.assumptions {
            block.push_str(&format!("- {}\n", a));
        }
    }

    Some(format!("{}{}", document.trim_end(), block))
}

pub struct SpecReviewPhase {
    command: String,
    timeout: Duration,
}

impl SpecReviewPhase {
    pub fn new(command: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.trim().to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PhaseExecutor for SpecReviewPhase {
    fn name(&self) -> &str {
        "spec-review"
    }

    fn timeout(&self) -> Option<Duration> {
        // Outer bound slightly above the subprocess bound so the subprocess
        // timeout is what reports.
        Some(self.timeout + Duration::from_secs(5))
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        if self.command.is_empty() {
            return Ok(PhaseResult::skip("no reviewer configured"));
        }
        let config = &ctx.config;
        if !config.requirements_file.exists() {
            return Ok(PhaseResult::skip(format!(
                "{} not found",
                config.requirements_file.display()
            )));
        }

        let env = [
            (
                "CRUCIBLE_REQUIREMENTS",
                config.requirements_file.display().to_string(),
            ),
            ("CRUCIBLE_DIR", config.crucible_dir.display().to_string()),
        ];
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
                "reviewer timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        if out.exit_code != 0 {
            return Ok(PhaseResult::warn(format!(
                "reviewer exited with code {}",
                out.exit_code
            )));
        }

        let enrichment_path = config.report_path(ENRICHMENT_FILE);
        let raw = match std::fs::read_to_string(&enrichment_path) {
            Ok(content) => Some(content),
            Err(_) => extract_json_object(&out.stdout),
        };
        let Some(raw) = raw else {
            return Ok(PhaseResult::pass("no enrichment proposed"));
        };
        let enrichment: Enrichment = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(e) => {
                debug!("unparseable reviewer output: {}", e);
                return Ok(PhaseResult::warn("reviewer output was not valid JSON"));
            }
        };

        let document = std::fs::read_to_string(&config.requirements_file).with_context(|| {
            format!("Failed to read {}", config.requirements_file.display())
        })?;
        match apply_enrichment(&document, &enrichment) {
            Some(updated) => {
                write_atomic(&config.requirements_file, updated.as_bytes()).with_context(
                    || format!("Failed to write {}", config.requirements_file.display()),
                )?;
                Ok(PhaseResult::pass(format!(
                    "{} enrichment items, {} assumptions appended",
                    enrichment.enrichment.len(),
                    enrichment.assumptions.len()
                )))
            }
            None => Ok(PhaseResult::pass("requirements already enriched")),
        }
    }
}
