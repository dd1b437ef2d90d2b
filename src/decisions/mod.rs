//! Append-only record of corrective decisions at `.crucible/decisions.jsonl`.
//!
//! Decisions are never edited or removed. Every append is mirrored to the
//! event stream as `decision.logged`.

use crate::events::{EventStream, kinds};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    /// Add detail the requirements never mentioned
    Enrich,
    /// Narrow an over-broad requirement
    Constrain,
    /// Drop a requirement from scope
    Descope,
    /// Spell out an existing requirement more precisely
    Detail,
    /// Direct a fix for a concrete failure
    Fix,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionKind::Enrich => write!(f, "enrich"),
            DecisionKind::Constrain => write!(f, "constrain"),
            DecisionKind::Descope => write!(f, "descope"),
            DecisionKind::Detail => write!(f, "detail"),
            DecisionKind::Fix => write!(f, "fix"),
        }
    }
}

impl std::str::FromStr for DecisionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enrich" => Ok(DecisionKind::Enrich),
            "constrain" => Ok(DecisionKind::Constrain),
            "descope" => Ok(DecisionKind::Descope),
            "detail" => Ok(DecisionKind::Detail),
            "fix" => Ok(DecisionKind::Fix),
            _ => anyhow::bail!(
                "Invalid decision kind '{}'. Valid values: enrich, constrain, descope, detail, fix",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub iteration: u32,
    pub kind: DecisionKind,
    /// What the decision applies to (work item key, test name, endpoint)
    pub target: String,
    pub decision: String,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        iteration: u32,
        kind: DecisionKind,
        target: impl Into<String>,
        decision: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            iteration,
            kind,
            target: target.into(),
            decision: decision.into(),
            rationale: rationale.into(),
            timestamp: Utc::now(),
        }
    }

    /// `from <= timestamp <= to`; either bound may be open.
    pub fn within(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
        from.is_none_or(|f| self.timestamp >= f) && to.is_none_or(|t| self.timestamp <= t)
    }
}

#[derive(Debug, Clone)]
pub struct DecisionLog {
    path: PathBuf,
    events: Option<EventStream>,
}

impl DecisionLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    pub fn append(&self, decision: &Decision) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let line = serde_json::to_string(decision).context("Failed to serialize decision")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open decision log {}", self.path.display()))?;
        writeln!(file, "{}", line).context("Failed to append decision")?;

        if let Some(events) = &self.events {
            events.record(
                kinds::DECISION_LOGGED,
                serde_json::to_value(decision).unwrap_or_default(),
            );
        }
        Ok(())
    }

    /// Every decision in append order. Malformed lines are skipped.
    pub fn all(&self) -> Result<Vec<Decision>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    pub fn by_kind(&self, kind: DecisionKind) -> Result<Vec<Decision>> {
        Ok(self.all()?.into_iter().filter(|d| d.kind == kind).collect())
    }

    /// Decisions with `from <= timestamp <= to`; either bound may be open.
    pub fn in_range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Decision>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|d| d.within(from, to))
            .collect())
    }

    /// Highest iteration any logged decision was made in.
    pub fn last_iteration(&self) -> Result<Option<u32>> {
        Ok(self.all()?.iter().map(|d| d.iteration).max())
    }

    pub fn for_iteration(&self, iteration: u32) -> Result<Vec<Decision>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|d| d.iteration == iteration)
            .collect())
    }
}
