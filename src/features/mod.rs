//! Work items ("features") and their lifecycle.
//!
//! ```text
//! pending ──attempt──► failed ──attempt (cycles < max)──► failed
//!    │                   │
//!    │                   └──attempt (cycles >= max)──► blocked   (absorbing)
//!    └──────pass─────────┴──────────────pass──────────► passed    (absorbing)
//! ```
//!
//! Unknown fields on a record are kept in `extra` and written back as-is.

pub mod store;

pub use store::{Counts, FeatureStore, ItemView, Snapshot, WorkGroup};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Failed,
    Blocked,
    Passed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Blocked | ItemStatus::Passed)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "failed" => Some(ItemStatus::Failed),
            "blocked" => Some(ItemStatus::Blocked),
            "passed" => Some(ItemStatus::Passed),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Failed => "failed",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Passed => "passed",
        })
    }
}

/// Why an attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptCause {
    /// Reported by the agent.
    Reported,
    /// Forced by the progress monitor after the item sat unresolved too long.
    Stalled,
}

/// Result of applying a transition to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Failed { cycles: u32 },
    Blocked { cycles: u32 },
    Passed,
    /// Attempt on a terminal item; nothing changed.
    AttemptIgnored { status: ItemStatus },
    /// Pass on a blocked item; nothing changed.
    PassRejected,
    /// Pass on an already passed item; nothing changed.
    AlreadyPassed,
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Transition::Failed { .. } | Transition::Blocked { .. } | Transition::Passed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub cycles: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stalled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkItem {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            status: ItemStatus::Pending,
            cycles: 0,
            created_at: Some(Utc::now()),
            passed_at: None,
            blocked_at: None,
            stalled_at: None,
            evidence: None,
            extra: Map::new(),
        }
    }

    /// Decode one record, normalizing the legacy boolean encoding.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let value = match value {
            Value::Object(map) => Value::Object(migrate_legacy(map)),
            other => other,
        };
        serde_json::from_value(value)
    }

    /// Record one failed try. Blocks the item once `cycles` reaches `max_cycles`.
    pub fn attempt(
        &mut self,
        max_cycles: u32,
        cause: AttemptCause,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.status.is_terminal() {
            debug!(id = %self.id, status = %self.status, "attempt on terminal item ignored");
            return Transition::AttemptIgnored {
                status: self.status,
            };
        }

        self.cycles += 1;
        if cause == AttemptCause::Stalled {
            self.stalled_at = Some(now);
        }
        if self.cycles >= max_cycles {
            self.status = ItemStatus::Blocked;
            self.blocked_at = Some(now);
            Transition::Blocked {
                cycles: self.cycles,
            }
        } else {
            self.status = ItemStatus::Failed;
            Transition::Failed {
                cycles: self.cycles,
            }
        }
    }

    /// Mark the item passed. Blocked items stay blocked.
    pub fn pass(&mut self, evidence: Option<&str>, now: DateTime<Utc>) -> Transition {
        match self.status {
            ItemStatus::Blocked => {
                warn!(id = %self.id, "pass rejected: item is blocked");
                Transition::PassRejected
            }
            ItemStatus::Passed => Transition::AlreadyPassed,
            ItemStatus::Pending | ItemStatus::Failed => {
                self.status = ItemStatus::Passed;
                self.passed_at = Some(now);
                if let Some(ev) = evidence {
                    self.evidence = Some(ev.to_string());
                }
                Transition::Passed
            }
        }
    }
}

/// Rewrite a legacy record (`blocked` / `passes` / `passed` booleans, `name`)
/// into the tagged form. Records with a valid `status` only lose the flags.
pub fn migrate_legacy(mut map: Map<String, Value>) -> Map<String, Value> {
    let flag = |map: &Map<String, Value>, key: &str| {
        map.get(key).and_then(Value::as_bool).unwrap_or(false)
    };
    let blocked = flag(&map, "blocked");
    let passed = flag(&map, "passes") || flag(&map, "passed");
    let has_legacy_flags = ["blocked", "passes", "passed"]
        .iter()
        .any(|k| map.get(*k).is_some_and(Value::is_boolean));

    let valid_status = map
        .get("status")
        .and_then(Value::as_str)
        .and_then(ItemStatus::parse);

    if valid_status.is_none() {
        let cycles = map.get("cycles").and_then(Value::as_u64).unwrap_or(0);
        let status = if blocked {
            ItemStatus::Blocked
        } else if passed {
            ItemStatus::Passed
        } else if cycles > 0 {
            ItemStatus::Failed
        } else {
            ItemStatus::Pending
        };
        map.insert("status".to_string(), Value::String(status.to_string()));
    }

    if has_legacy_flags {
        for key in ["blocked", "passes", "passed"] {
            if map.get(key).is_some_and(Value::is_boolean) {
                map.shift_remove(key);
            }
        }
    }

    let missing_description = map
        .get("description")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty);
    if missing_description && let Some(name) = map.get("name").and_then(Value::as_str) {
        let name = name.to_string();
        map.insert("description".to_string(), Value::String(name));
    }

    map
}
