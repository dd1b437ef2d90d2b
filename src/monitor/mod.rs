//! Progress monitor for the build phase.
//!
//! [`ProgressTracker`] holds the detection rules and is driven with explicit
//! timestamps; [`spawn_monitor`] polls the state store on an interval, feeds
//! the tracker and acts on what it returns. Cancellation is signalled through
//! a `CancellationToken` that the build phase selects on.

use crate::crucible_config::BuildSection;
use crate::events::{EventStream, kinds};
use crate::features::{AttemptCause, FeatureStore, ItemStatus, Snapshot};
use crate::ui::BuildProgress;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// No new resolution for this long while nearly done cancels the build
    pub stall_timeout: Duration,
    /// No new resolution for this long cancels the build
    pub absolute_timeout: Duration,
    /// Completion percentage above which `stall_timeout` applies
    pub stall_threshold_pct: f64,
    pub item_warn_after: Duration,
    pub item_force_after: Duration,
}

impl MonitorSettings {
    pub fn from_build(build: &BuildSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(build.poll_interval_secs.max(1)),
            stall_timeout: Duration::from_secs(build.timeout_stall_minutes * 60),
            absolute_timeout: Duration::from_secs(build.timeout_absolute_minutes * 60),
            stall_threshold_pct: build.stall_threshold_pct,
            item_warn_after: Duration::from_secs(build.item_warn_secs),
            item_force_after: Duration::from_secs(build.item_force_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelReason {
    Stall { idle: Duration, resolved_pct: f64 },
    Absolute { idle: Duration },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Stall { idle, resolved_pct } => write!(
                f,
                "stall timeout: no progress for {}s at {:.0}% resolved",
                idle.as_secs(),
                resolved_pct
            ),
            CancelReason::Absolute { idle } => {
                write!(f, "absolute timeout: no progress for {}s", idle.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    /// An item reached a terminal state since the last observation.
    Resolved { key: String, status: ItemStatus },
    StallWarning {
        group: String,
        id: String,
        unresolved: Duration,
    },
    ForceAdvance { group: String, id: String },
    Cancel(CancelReason),
}

#[derive(Debug)]
struct ItemWatch {
    since: Instant,
    cycles: u32,
    status: ItemStatus,
    warned: bool,
    forced: bool,
}

/// Timeout and staleness detection over successive store snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    settings: MonitorSettings,
    last_resolved: usize,
    last_progress_at: Instant,
    resolved: HashSet<String>,
    watches: HashMap<String, ItemWatch>,
    cancelled: bool,
}

impl ProgressTracker {
    pub fn new(settings: MonitorSettings, now: Instant) -> Self {
        Self {
            settings,
            last_resolved: 0,
            last_progress_at: now,
            resolved: HashSet::new(),
            watches: HashMap::new(),
            cancelled: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Treat items already terminal in `snapshot` as seen, so only items
    /// resolved after this point are reported.
    pub fn seed(&mut self, snapshot: &Snapshot) {
        for item in snapshot.items.iter().filter(|i| i.status.is_terminal()) {
            self.resolved.insert(item.key());
        }
        self.last_resolved = snapshot.counts.resolved();
    }

    /// Compare `snapshot` with what was seen before. After a `Cancel` the
    /// tracker is inert and returns nothing.
    pub fn observe(&mut self, snapshot: &Snapshot, now: Instant) -> Vec<MonitorAction> {
        if self.cancelled {
            return Vec::new();
        }
        let mut actions = Vec::new();

        for item in &snapshot.items {
            let key = item.key();
            if item.status.is_terminal() {
                self.watches.remove(&key);
                if self.resolved.insert(key.clone()) {
                    actions.push(MonitorAction::Resolved {
                        key,
                        status: item.status,
                    });
                }
                continue;
            }

            let watch = self.watches.entry(key).or_insert(ItemWatch {
                since: now,
                cycles: item.cycles,
                status: item.status,
                warned: false,
                forced: false,
            });
            // Any change on the item starts a new stall episode.
            if watch.cycles != item.cycles || watch.status != item.status {
                *watch = ItemWatch {
                    since: now,
                    cycles: item.cycles,
                    status: item.status,
                    warned: false,
                    forced: false,
                };
            }
            let unresolved = now.saturating_duration_since(watch.since);
            if !watch.warned && unresolved >= self.settings.item_warn_after {
                watch.warned = true;
                actions.push(MonitorAction::StallWarning {
                    group: item.group.clone(),
                    id: item.id.clone(),
                    unresolved,
                });
            }
            if !watch.forced && unresolved >= self.settings.item_force_after {
                watch.forced = true;
                actions.push(MonitorAction::ForceAdvance {
                    group: item.group.clone(),
                    id: item.id.clone(),
                });
            }
        }

        let resolved = snapshot.counts.resolved();
        if resolved > self.last_resolved {
            self.last_resolved = resolved;
            self.last_progress_at = now;
        }

        let idle = now.saturating_duration_since(self.last_progress_at);
        let resolved_pct = snapshot.counts.resolved_pct();
        // No items yet: the agent is still planning.
        let reason = if snapshot.counts.total == 0 {
            None
        } else if idle >= self.settings.stall_timeout
            && resolved_pct > self.settings.stall_threshold_pct
        {
            Some(CancelReason::Stall { idle, resolved_pct })
        } else if idle >= self.settings.absolute_timeout {
            Some(CancelReason::Absolute { idle })
        } else {
            None
        };
        if let Some(reason) = reason {
            self.cancelled = true;
            actions.push(MonitorAction::Cancel(reason));
        }

        actions
    }
}

/// What the monitor did over the life of one build.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub cancel_reason: Option<CancelReason>,
    pub forced: Vec<String>,
    pub warned: Vec<String>,
}

/// Poll `store` until `done` fires or the tracker decides to cancel.
///
/// On a timeout `cancel` is triggered exactly once and a `build.timeout`
/// event is written.
pub fn spawn_monitor(
    store: FeatureStore,
    events: EventStream,
    settings: MonitorSettings,
    cancel: CancellationToken,
    done: CancellationToken,
    progress: Option<BuildProgress>,
) -> JoinHandle<MonitorReport> {
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new(settings, Instant::now());
        tracker.seed(&store.snapshot());
        let mut report = MonitorReport::default();
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = store.snapshot();
            if let Some(p) = &progress {
                p.update(&snapshot.counts);
            }

            for action in tracker.observe(&snapshot, Instant::now()) {
                match action {
                    MonitorAction::Resolved { key, status } => {
                        if let Some(p) = &progress {
                            p.item_resolved(&key, status);
                        }
                    }
                    MonitorAction::StallWarning {
                        group,
                        id,
                        unresolved,
                    } => {
                        warn!(
                            "{}/{} unresolved for {}s",
                            group,
                            id,
                            unresolved.as_secs()
                        );
                        events.record(
                            kinds::FEATURE_STALL_WARNING,
                            json!({
                                "group": group,
                                "feature_id": id,
                                "unresolved_secs": unresolved.as_secs()
                            }),
                        );
                        report.warned.push(format!("{}/{}", group, id));
                    }
                    MonitorAction::ForceAdvance { group, id } => {
                        info!("Force-advancing stalled item {}/{}", group, id);
                        match store.attempt(&group, &id, AttemptCause::Stalled) {
                            Ok(_) => report.forced.push(format!("{}/{}", group, id)),
                            Err(e) => warn!("Failed to advance {}/{}: {}", group, id, e),
                        }
                    }
                    MonitorAction::Cancel(reason) => {
                        warn!("Cancelling build: {}", reason);
                        events.record(
                            kinds::BUILD_TIMEOUT,
                            json!({
                                "reason": reason.to_string(),
                                "resolved": snapshot.counts.resolved(),
                                "total": snapshot.counts.total,
                            }),
                        );
                        cancel.cancel();
                        report.cancel_reason = Some(reason);
                    }
                }
            }

            if tracker.is_cancelled() {
                break;
            }
        }
        report
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Counts, ItemView, WorkItem};
    use tempfile::tempdir;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(12 * 60),
            absolute_timeout: Duration::from_secs(20 * 60),
            stall_threshold_pct: 80.0,
            item_warn_after: Duration::from_secs(300),
            item_force_after: Duration::from_secs(480),
        }
    }

    fn snapshot(items: &[(&str, ItemStatus, u32)]) -> Snapshot {
        let mut snap = Snapshot::default();
        for (id, status, cycles) in items {
            snap.counts.add(*status);
            snap.items.push(ItemView {
                group: "g".into(),
                id: id.to_string(),
                description: String::new(),
                status: *status,
                cycles: *cycles,
            });
        }
        snap
    }

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn cancels(actions: &[MonitorAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, MonitorAction::Cancel(_)))
            .count()
    }

    // =========================================
    // Build-level timeouts
    // =========================================

    #[test]
    fn test_stall_timeout_fires_above_threshold() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        // 9 of 10 resolved: 90% > 80%.
        let mut items: Vec<(&str, ItemStatus, u32)> = ["a", "b", "c", "d", "e", "f", "g", "h", "i"]
            .iter()
            .map(|id| (*id, ItemStatus::Passed, 0))
            .collect();
        items.push(("last", ItemStatus::Pending, 0));
        let snap = snapshot(&items);

        assert_eq!(cancels(&tracker.observe(&snap, t0)), 0);
        assert_eq!(cancels(&tracker.observe(&snap, t0 + mins(11))), 0);
        let actions = tracker.observe(&snap, t0 + mins(12));
        assert!(matches!(
            actions.last(),
            Some(MonitorAction::Cancel(CancelReason::Stall { .. }))
        ));
    }

    #[test]
    fn test_stall_timeout_ignored_below_threshold() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        let snap = snapshot(&[("a", ItemStatus::Passed, 0), ("b", ItemStatus::Pending, 0)]);
        tracker.observe(&snap, t0);
        assert_eq!(cancels(&tracker.observe(&snap, t0 + mins(15))), 0);

        let actions = tracker.observe(&snap, t0 + mins(20));
        assert!(matches!(
            actions.last(),
            Some(MonitorAction::Cancel(CancelReason::Absolute { .. }))
        ));
    }

    #[test]
    fn test_progress_resets_idle_clock() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        let before = snapshot(&[("a", ItemStatus::Pending, 0), ("b", ItemStatus::Pending, 0)]);
        let after = snapshot(&[("a", ItemStatus::Passed, 0), ("b", ItemStatus::Pending, 0)]);
        tracker.observe(&before, t0);
        let actions = tracker.observe(&after, t0 + mins(19));
        assert!(actions.contains(&MonitorAction::Resolved {
            key: "g/a".into(),
            status: ItemStatus::Passed
        }));
        assert_eq!(cancels(&tracker.observe(&after, t0 + mins(38))), 0);
        assert_eq!(cancels(&tracker.observe(&after, t0 + mins(39))), 1);
    }

    #[test]
    fn test_cancel_fires_exactly_once() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        let snap = snapshot(&[("a", ItemStatus::Pending, 0)]);
        let mut total = 0;
        for minute in 0..40 {
            total += cancels(&tracker.observe(&snap, t0 + mins(minute)));
        }
        assert_eq!(total, 1);
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_no_timeout_before_items_exist() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        let empty = Snapshot::default();
        assert_eq!(cancels(&tracker.observe(&empty, t0 + mins(20))), 0);
        assert_eq!(cancels(&tracker.observe(&empty, t0 + mins(45))), 0);
        assert!(!tracker.is_cancelled());

        // Once items appear the idle clock still counts from the start.
        let snap = snapshot(&[("a", ItemStatus::Pending, 0)]);
        assert_eq!(cancels(&tracker.observe(&snap, t0 + mins(46))), 1);
    }

    #[test]
    fn test_seeded_items_are_not_reported_again() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings(), t0);
        let earlier = snapshot(&[("a", ItemStatus::Passed, 0), ("b", ItemStatus::Pending, 0)]);
        tracker.seed(&earlier);
        assert!(tracker.observe(&earlier, t0).is_empty());

        let later = snapshot(&[("a", ItemStatus::Passed, 0), ("b", ItemStatus::Blocked, 5)]);
        assert_eq!(
            tracker.observe(&later, t0 + mins(1)),
            vec![MonitorAction::Resolved {
                key: "g/b".into(),
                status: ItemStatus::Blocked
            }]
        );
    }

    // =========================================
    // Per-item staleness
    // =========================================

    #[test]
    fn test_item_warning_then_force_once_per_episode() {
        let settings = MonitorSettings {
            absolute_timeout: mins(60),
            ..settings()
        };
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(settings, t0);
        let snap = snapshot(&[("a", ItemStatus::Pending, 0)]);

        assert!(tracker.observe(&snap, t0).is_empty());
        let at_5 = tracker.observe(&snap, t0 + mins(5));
        assert!(matches!(at_5.as_slice(), [MonitorAction::StallWarning { .. }]));
        assert!(tracker.observe(&snap, t0 + mins(6)).is_empty());
        let at_8 = tracker.observe(&snap, t0 + mins(8));
        assert_eq!(
            at_8,
            vec![MonitorAction::ForceAdvance {
                group: "g".into(),
                id: "a".into()
            }]
        );
        assert!(tracker.observe(&snap, t0 + mins(9)).is_empty());

        // The forced attempt bumps cycles: a fresh episode starts.
        let bumped = snapshot(&[("a", ItemStatus::Failed, 1)]);
        assert!(tracker.observe(&bumped, t0 + mins(10)).is_empty());
        let again = tracker.observe(&bumped, t0 + mins(18));
        assert!(
            again
                .iter()
                .any(|a| matches!(a, MonitorAction::ForceAdvance { .. }))
        );
    }

    #[test]
    fn test_settings_from_build_section() {
        let s = MonitorSettings::from_build(&BuildSection::default());
        assert_eq!(s.stall_timeout, mins(12));
        assert_eq!(s.absolute_timeout, mins(20));
        assert_eq!(s.item_warn_after, Duration::from_secs(300));
        assert_eq!(s.item_force_after, Duration::from_secs(480));
        assert_eq!(s.poll_interval, Duration::from_secs(2));
    }

    // =========================================
    // Async poller
    // =========================================

    #[tokio::test]
    async fn test_spawned_monitor_cancels_once_and_records_event() {
        let dir = tempdir().unwrap();
        let events = EventStream::new(&dir.path().join("events.jsonl"));
        let store = FeatureStore::new(&dir.path().join("groups"), 5).with_events(events.clone());
        store
            .write_group("g", vec![WorkItem::new("a", "never finishes")])
            .unwrap();

        let settings = MonitorSettings {
            poll_interval: Duration::from_millis(20),
            stall_timeout: Duration::from_millis(100),
            absolute_timeout: Duration::from_millis(150),
            stall_threshold_pct: 80.0,
            item_warn_after: Duration::from_secs(60),
            item_force_after: Duration::from_secs(120),
        };
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let handle = spawn_monitor(store, events.clone(), settings, cancel.clone(), done, None);

        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("monitor should cancel");
        let report = handle.await.unwrap();

        assert!(matches!(
            report.cancel_reason,
            Some(CancelReason::Absolute { .. })
        ));
        assert_eq!(events.by_kind(kinds::BUILD_TIMEOUT).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_when_done() {
        let dir = tempdir().unwrap();
        let events = EventStream::new(&dir.path().join("events.jsonl"));
        let store = FeatureStore::new(&dir.path().join("groups"), 5);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let mut s = settings();
        s.poll_interval = Duration::from_millis(10);
        let handle = spawn_monitor(store, events, s, cancel.clone(), done.clone(), None);

        done.cancel();
        let report = handle.await.unwrap();
        assert!(report.cancel_reason.is_none());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_counts_helper_matches_snapshot() {
        let snap = snapshot(&[("a", ItemStatus::Blocked, 5), ("b", ItemStatus::Failed, 1)]);
        assert_eq!(
            snap.counts,
            Counts {
                total: 2,
                passed: 0,
                blocked: 1,
                failed: 1,
                pending: 0
            }
        );
    }
}
