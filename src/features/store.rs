use super::{AttemptCause, ItemStatus, Transition, WorkItem};
use crate::errors::StoreError;
use crate::events::{EventStream, kinds};
use crate::util::{with_exclusive_lock, write_atomic};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of a group's work-item document.
pub const FEATURES_FILE: &str = "features.json";

/// One group's document: its items plus any other top-level keys.
#[derive(Debug, Clone)]
pub struct WorkGroup {
    pub name: String,
    pub path: PathBuf,
    pub items: Vec<WorkItem>,
    pub extra: Map<String, Value>,
}

impl WorkGroup {
    /// Parse a document. Accepts `{"features": [...]}` or a bare array.
    pub fn parse(name: &str, path: &Path, content: &str) -> Result<Self, StoreError> {
        let parse_err = |source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let value: Value = serde_json::from_str(content).map_err(parse_err)?;
        let (raw_items, extra) = match value {
            Value::Array(items) => (items, Map::new()),
            Value::Object(mut map) => {
                let items = match map.shift_remove("features") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                (items, map)
            }
            _ => (Vec::new(), Map::new()),
        };
        let items = raw_items
            .into_iter()
            .map(WorkItem::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(parse_err)?;

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            items,
            extra,
        })
    }

    pub fn render(&self) -> Result<String, serde_json::Error> {
        let mut doc = Map::new();
        doc.insert("features".to_string(), serde_json::to_value(&self.items)?);
        for (k, v) in &self.extra {
            doc.insert(k.clone(), v.clone());
        }
        serde_json::to_string_pretty(&Value::Object(doc))
    }

    pub fn item_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }
}

/// Status counts across every group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub total: usize,
    pub passed: usize,
    pub blocked: usize,
    pub failed: usize,
    pub pending: usize,
}

impl Counts {
    pub fn add(&mut self, status: ItemStatus) {
        self.total += 1;
        match status {
            ItemStatus::Passed => self.passed += 1,
            ItemStatus::Blocked => self.blocked += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Pending => self.pending += 1,
        }
    }

    /// Items in a terminal state.
    pub fn resolved(&self) -> usize {
        self.passed + self.blocked
    }

    pub fn remaining(&self) -> usize {
        self.total - self.resolved()
    }

    pub fn resolved_pct(&self) -> f64 {
        pct(self.resolved(), self.total)
    }

    pub fn passed_pct(&self) -> f64 {
        pct(self.passed, self.total)
    }
}

fn pct(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 * 100.0 / total as f64
    }
}

/// Read-only view of one item inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub group: String,
    pub id: String,
    pub description: String,
    pub status: ItemStatus,
    pub cycles: u32,
}

impl ItemView {
    /// `group/id`, unique across the store.
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub items: Vec<ItemView>,
    pub counts: Counts,
}

impl Snapshot {
    pub fn blocked(&self) -> impl Iterator<Item = &ItemView> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Blocked)
    }

    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = self.items.iter().map(|i| i.group.as_str()).collect();
        groups.dedup();
        groups
    }
}

/// Work-item documents under `context/groups/<group>/features.json`.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    groups_dir: PathBuf,
    max_cycles: u32,
    events: Option<EventStream>,
}

impl FeatureStore {
    pub fn new(groups_dir: &Path, max_cycles: u32) -> Self {
        Self {
            groups_dir: groups_dir.to_path_buf(),
            max_cycles,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.groups_dir.join(group).join(FEATURES_FILE)
    }

    /// Names of groups that have a document, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.groups_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(FEATURES_FILE).is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn load_group(&self, group: &str) -> Result<WorkGroup, StoreError> {
        let path = self.group_path(group);
        if !path.exists() {
            return Err(StoreError::GroupNotFound {
                group: group.to_string(),
                dir: self.groups_dir.clone(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        WorkGroup::parse(group, &path, &content)
    }

    pub fn save_group(&self, group: &WorkGroup) -> Result<(), StoreError> {
        let rendered = group.render().map_err(|source| StoreError::Parse {
            path: group.path.clone(),
            source,
        })?;
        write_atomic(&group.path, rendered.as_bytes()).map_err(|source| StoreError::Write {
            path: group.path.clone(),
            source,
        })
    }

    /// Create or replace a group document.
    pub fn write_group(&self, group: &str, items: Vec<WorkItem>) -> Result<WorkGroup, StoreError> {
        let group = WorkGroup {
            name: group.to_string(),
            path: self.group_path(group),
            items,
            extra: Map::new(),
        };
        self.save_group(&group)?;
        Ok(group)
    }

    /// Group holding an item with this id, when exactly one does.
    pub fn find_group(&self, id: &str) -> Option<String> {
        let mut matches = self.group_names().into_iter().filter(|g| {
            self.load_group(g)
                .map(|wg| wg.items.iter().any(|i| i.id == id))
                .unwrap_or(false)
        });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Record one failed try for `group/id`.
    pub fn attempt(
        &self,
        group: &str,
        id: &str,
        cause: AttemptCause,
    ) -> Result<Transition, StoreError> {
        let max = self.max_cycles;
        let transition = self.modify(group, id, |item| item.attempt(max, cause, Utc::now()))?;
        self.announce(group, id, cause, &transition);
        Ok(transition)
    }

    /// Mark `group/id` passed.
    pub fn pass(
        &self,
        group: &str,
        id: &str,
        evidence: Option<&str>,
    ) -> Result<Transition, StoreError> {
        let transition = self.modify(group, id, |item| item.pass(evidence, Utc::now()))?;
        match &transition {
            Transition::Passed => {
                info!(group, id, "work item passed");
                self.emit(
                    kinds::FEATURE_PASSED,
                    json!({"group": group, "feature_id": id, "evidence": evidence}),
                );
            }
            Transition::PassRejected => self.emit(
                kinds::FEATURE_PASS_REJECTED,
                json!({"group": group, "feature_id": id, "reason": "item is blocked"}),
            ),
            _ => {}
        }
        Ok(transition)
    }

    fn modify<F>(&self, group: &str, id: &str, f: F) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut WorkItem) -> Transition,
    {
        let path = self.group_path(group);
        let locked = with_exclusive_lock(&path, || -> Result<Transition, StoreError> {
            let mut doc = self.load_group(group)?;
            let item = doc.item_mut(id).ok_or_else(|| StoreError::ItemNotFound {
                group: group.to_string(),
                id: id.to_string(),
            })?;
            let transition = f(item);
            if transition.changed() {
                self.save_group(&doc)?;
            }
            Ok(transition)
        });
        locked.map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?
    }

    fn announce(&self, group: &str, id: &str, cause: AttemptCause, transition: &Transition) {
        if cause == AttemptCause::Stalled && transition.changed() {
            self.emit(
                kinds::FEATURE_STALLED,
                json!({"group": group, "feature_id": id}),
            );
        }
        match transition {
            Transition::Failed { cycles } => {
                debug!(group, id, cycles, "work item failed");
                self.emit(
                    kinds::FEATURE_FAILED,
                    json!({"group": group, "feature_id": id, "cycle": cycles}),
                );
            }
            Transition::Blocked { cycles } => {
                warn!(group, id, cycles, "work item blocked");
                self.emit(
                    kinds::FEATURE_BLOCKED,
                    json!({
                        "group": group,
                        "feature_id": id,
                        "cycle": cycles,
                        "reason": format!("exceeded {} cycles", self.max_cycles),
                    }),
                );
            }
            Transition::AttemptIgnored { status } => self.emit(
                kinds::FEATURE_ATTEMPT_IGNORED,
                json!({"group": group, "feature_id": id, "status": status}),
            ),
            _ => {}
        }
    }

    fn emit(&self, kind: &str, data: Value) {
        if let Some(events) = &self.events {
            events.record(kind, data);
        }
    }

    /// Every readable item across all groups. Unreadable documents are
    /// skipped with a warning; a reader never fails on a half-written file.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for group in self.group_names() {
            match self.load_group(&group) {
                Ok(doc) => {
                    for item in doc.items {
                        snapshot.counts.add(item.status);
                        snapshot.items.push(ItemView {
                            group: group.clone(),
                            id: item.id,
                            description: item.description,
                            status: item.status,
                            cycles: item.cycles,
                        });
                    }
                }
                Err(e) => warn!("Skipping unreadable work group {}: {}", group, e),
            }
        }
        snapshot
    }
}
