//! Shared-context injection into the agent instruction file.
//!
//! The section is rebuilt on every run from the context index, the decision
//! log and accumulated learnings; the previous copy is removed first.

use crate::decisions::Decision;
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult};
use crate::util::{truncate_chars, write_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

pub const CONTEXT_MARKER: &str = "## Shared Context (auto-generated)";

const MAX_DECISIONS: usize = 15;
const MAX_LEARNINGS_CHARS: usize = 6_000;

/// Replace (or insert) the section headed `marker`.
///
/// The section ends at the next `## ` heading. A new section goes before
/// the document's first `## ` heading after the title, or at the end.
pub fn replace_section(document: &str, marker: &str, body: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut skipping = false;
    for line in document.lines() {
        if line.trim() == marker {
            skipping = true;
            continue;
        }
        if skipping && line.starts_with("## ") {
            skipping = false;
        }
        if !skipping {
            lines.push(line);
        }
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let insert_at = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, l)| l.starts_with("## "))
        .map(|(i, _)| i)
        .unwrap_or(lines.len());

    let section = format!("{}\n\n{}\n", marker, body.trim_end());
    let mut out = String::new();
    for line in &lines[..insert_at] {
        out.push_str(line);
        out.push('\n');
    }
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
    out.push_str(&section);
    if insert_at < lines.len() {
        out.push('\n');
        for line in &lines[insert_at..] {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Assemble the section body. Empty when there is nothing to share.
pub fn build_context_body(
    index: Option<&str>,
    decisions: &[Decision],
    learnings: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(index) = index.map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(format!("### Context Index\n\n{}", index));
    }

    if !decisions.is_empty() {
        let start = decisions.len().saturating_sub(MAX_DECISIONS);
        let lines: Vec<String> = decisions[start..]
            .iter()
            .map(|d| format!("- [{}] {}: {}", d.kind, d.target, d.decision))
            .collect();
        parts.push(format!("### Previous Decisions\n\n{}", lines.join("\n")));
    }

    if let Some(learnings) = learnings.map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(format!(
            "### Learnings from Previous Runs\n\n{}",
            truncate_chars(learnings, MAX_LEARNINGS_CHARS)
        ));
    }

    parts.join("\n\n")
}

pub struct ContextPhase {
    timeout: Duration,
}

impl ContextPhase {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PhaseExecutor for ContextPhase {
    fn name(&self) -> &str {
        "context"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        let config = &ctx.config;
        let target = &config.instructions_file;
        if !target.exists() {
            return Ok(PhaseResult::skip(format!(
                "{} not found",
                target.display()
            )));
        }

        let index_path = config
            .requirements_file
            .parent()
            .map(|dir| dir.join("_index.md"));
        let index = index_path.and_then(|p| std::fs::read_to_string(p).ok());
        let learnings = std::fs::read_to_string(&config.learnings_file).ok();
        let decisions = ctx.decisions.all()?;

        let body = build_context_body(index.as_deref(), &decisions, learnings.as_deref());
        if body.is_empty() {
            return Ok(PhaseResult::skip("no context to inject"));
        }

        let document = std::fs::read_to_string(target)
            .with_context(|| format!("Failed to read {}", target.display()))?;
        let updated = replace_section(&document, CONTEXT_MARKER, &body);
        write_atomic(target, updated.as_bytes())
            .with_context(|| format!("Failed to write {}", target.display()))?;

        Ok(PhaseResult::pass(format!(
            "{} decisions, learnings {}",
            decisions.len().min(MAX_DECISIONS),
            if learnings.is_some() { "included" } else { "absent" }
        )))
    }
}
