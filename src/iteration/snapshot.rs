//! Per-iteration snapshots under `.crucible/iterations/v<NNN>/`.

use super::feedback::Feedback;
use crate::features::Counts;
use crate::gates::GateReport;
use crate::util::{line_count, write_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST: &str = "manifest.json";
pub const FEEDBACK: &str = "feedback.md";
pub const SPEC_DIFF: &str = "spec-diff.md";

pub fn snapshot_dir(iterations_dir: &Path, iteration: u32) -> PathBuf {
    iterations_dir.join(format!("v{:03}", iteration))
}

/// Highest `v<NNN>` snapshot present, if any.
pub fn latest_iteration(iterations_dir: &Path) -> Option<u32> {
    std::fs::read_dir(iterations_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix('v')?
                .parse::<u32>()
                .ok()
        })
        .max()
}

/// Hex SHA-256 of the requirements document, truncated to 12 chars.
pub fn spec_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub counts: Counts,
    pub coverage: Option<f64>,
    pub gates_passed: bool,
    pub spec_hash: String,
    pub spec_lines: usize,
}

/// Write `manifest.json` and `feedback.md` for `iteration`.
pub fn write_snapshot(
    iterations_dir: &Path,
    iteration: u32,
    counts: &Counts,
    gates: &GateReport,
    feedback: &Feedback,
    requirements: &str,
) -> Result<PathBuf> {
    let dir = snapshot_dir(iterations_dir, iteration);
    let manifest = Manifest {
        iteration,
        timestamp: Utc::now(),
        counts: *counts,
        coverage: gates.coverage(),
        gates_passed: gates.passed,
        spec_hash: spec_hash(requirements),
        spec_lines: line_count(requirements),
    };
    let json = serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
    write_atomic(&dir.join(MANIFEST), json.as_bytes())
        .with_context(|| format!("Failed to write manifest in {}", dir.display()))?;
    write_atomic(&dir.join(FEEDBACK), feedback.to_markdown().as_bytes())
        .with_context(|| format!("Failed to write feedback in {}", dir.display()))?;
    Ok(dir)
}

pub fn read_manifest(iterations_dir: &Path, iteration: u32) -> Result<Manifest> {
    let path = snapshot_dir(iterations_dir, iteration).join(MANIFEST);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Line diff of the changed middle region, after stripping the common
/// leading and trailing lines.
pub fn render_diff(before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed = &old[prefix..old.len() - suffix];
    let added = &new[prefix..new.len() - suffix];
    if removed.is_empty() && added.is_empty() {
        return "(no changes)\n".to_string();
    }

    let mut out = format!("@@ line {} @@\n", prefix + 1);
    for line in removed {
        out.push_str(&format!("- {}\n", line));
    }
    for line in added {
        out.push_str(&format!("+ {}\n", line));
    }
    out
}

pub fn write_spec_diff(
    iterations_dir: &Path,
    iteration: u32,
    before: &str,
    after: &str,
) -> Result<PathBuf> {
    let path = snapshot_dir(iterations_dir, iteration).join(SPEC_DIFF);
    let body = format!(
        "# Requirements diff after iteration {}\n\n```diff\n{}```\n",
        iteration,
        render_diff(before, after)
    );
    write_atomic(&path, body.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
