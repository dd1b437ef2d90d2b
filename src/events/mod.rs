//! Append-only JSONL event stream at `.crucible/event-stream.jsonl`.
//!
//! One JSON object per line. Sequence numbers are strictly increasing and
//! timestamps never go backwards, even when the orchestrator and agent
//! processes append concurrently: the next sequence number is computed under
//! an exclusive file lock from the last line of the file.

pub mod kinds;

use crate::util::with_exclusive_lock;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Agent name recorded when the orchestrator itself emits an event.
pub const SYSTEM_AGENT: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub data: Value,
}

fn default_agent() -> String {
    SYSTEM_AGENT.to_string()
}

#[derive(Debug, Clone)]
pub struct EventStream {
    path: PathBuf,
}

impl EventStream {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event emitted by the orchestrator.
    pub fn emit(&self, kind: &str, data: Value) -> Result<Event> {
        self.emit_as(kind, SYSTEM_AGENT, data)
    }

    /// Append an event on behalf of `agent`.
    pub fn emit_as(&self, kind: &str, agent: &str, data: Value) -> Result<Event> {
        let path = self.path.clone();
        with_exclusive_lock(&self.path, || -> Result<Event> {
            let last = last_event(&path);
            let seq = last.as_ref().map(|e| e.seq + 1).unwrap_or(1);
            let now = Utc::now();
            let timestamp = match &last {
                Some(prev) if prev.timestamp > now => prev.timestamp,
                _ => now,
            };
            let event = Event {
                id: format!("{}-{}", kind, seq),
                seq,
                timestamp,
                kind: kind.to_string(),
                agent: agent.to_string(),
                data,
            };

            let line = serde_json::to_string(&event).context("Failed to serialize event")?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open event stream {}", path.display()))?;
            writeln!(file, "{}", line).context("Failed to append event")?;
            Ok(event)
        })?
    }

    /// Emit, logging instead of failing. For call sites where an event is
    /// informational and must not abort the caller.
    pub fn record(&self, kind: &str, data: Value) {
        if let Err(e) = self.emit(kind, data) {
            warn!("Failed to record {} event: {:#}", kind, e);
        }
    }

    /// Every parseable event in file order. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(parse_lines(&content))
    }

    pub fn read_since(&self, seq: u64) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.seq > seq)
            .collect())
    }

    pub fn by_kind(&self, kind: &str) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect())
    }
}

fn parse_lines(content: &str) -> Vec<Event> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Event>(l).ok())
        .collect()
}

/// Bytes read per step when scanning backwards for the last event.
const TAIL_CHUNK: u64 = 8 * 1024;

/// Last parseable event, read from the end of the file so appends stay
/// cheap as the stream grows.
fn last_event(path: &Path) -> Option<Event> {
    let mut file = File::open(path).ok()?;
    let mut end = file.metadata().ok()?.len();
    // Bytes before `end` not yet known to hold a complete line.
    let mut pending: Vec<u8> = Vec::new();

    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0; (end - start) as usize];
        file.seek(SeekFrom::Start(start)).ok()?;
        file.read_exact(&mut chunk).ok()?;
        chunk.extend_from_slice(&pending);
        end = start;

        // Everything after the first newline is made of whole lines; at the
        // start of the file the first fragment is whole too.
        let whole_from = match (start, chunk.iter().position(|b| *b == b'\n')) {
            (0, _) => 0,
            (_, Some(i)) => i + 1,
            (_, None) => {
                pending = chunk;
                continue;
            }
        };
        let found = String::from_utf8_lossy(&chunk[whole_from..])
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .find_map(|l| serde_json::from_str::<Event>(l).ok());
        if found.is_some() {
            return found;
        }
        chunk.truncate(whole_from);
        pending = chunk;
    }
    None
}
