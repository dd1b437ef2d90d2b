//! Runtime probes as ground truth for endpoint requirements.
//!
//! A probe result replaces whatever the outcome evaluator concluded about
//! the same endpoint, and the verdict is recorded under `final` so a later
//! heuristic evaluation cannot flip it back. Coverage is recomputed from the
//! reconciled lists.

use super::reports::{OUTCOME_REPORT, OutcomeReport, PROBE_REPORT, Probe, RuntimeTrace, read_report};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

static ENDPOINT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS)\s+(/[^\s:]*)").unwrap()
});

/// Canonical key `"METHOD /path"`: upper-case method, no query string, no
/// trailing slash (except for the root).
pub fn endpoint_key(method: &str, path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let trimmed = path.trim_end_matches('/');
    let path = if trimmed.is_empty() { "/" } else { trimmed };
    format!("{} {}", method.trim().to_uppercase(), path)
}

/// Endpoint key named at the start of a requirement label, if any.
pub fn label_endpoint(label: &str) -> Option<String> {
    let caps = ENDPOINT_REGEX.captures(label)?;
    Some(endpoint_key(&caps[1], &caps[2]))
}

fn probe_key(probe: &Probe) -> String {
    endpoint_key(&probe.method, &probe.endpoint)
}

/// Reconcile `report` against probe results. Returns the number of endpoint
/// verdicts that are final after reconciliation.
pub fn reconcile(report: &mut OutcomeReport, trace: Option<&RuntimeTrace>) -> usize {
    let mut reasons = BTreeMap::new();
    if let Some(trace) = trace {
        for probe in &trace.probes {
            let key = probe_key(probe);
            report.finals.insert(key.clone(), probe.passed);
            if !probe.passed {
                reasons.insert(key, probe.describe());
            }
        }
    }
    if report.finals.is_empty() {
        return 0;
    }

    let settled: BTreeSet<String> = report.finals.keys().cloned().collect();
    let is_final = |label: &String| label_endpoint(label).is_some_and(|key| settled.contains(&key));
    report.met.retain(|l| !is_final(l));
    report.unmet.retain(|l| !is_final(l));

    for (key, met) in &report.finals {
        if *met {
            report.met.push(key.clone());
        } else {
            let reason = reasons
                .get(key)
                .cloned()
                .unwrap_or_else(|| format!("{}: failed runtime probe", key));
            report.unmet.push(reason);
        }
    }

    let total = report.met.len() + report.unmet.len();
    if total > 0 {
        report.coverage = Some(report.met.len() as f64 / total as f64 * 100.0);
    }
    report.finals.len()
}

/// Reconcile the outcome report on disk with the probe trace on disk and
/// write it back. Does nothing when either report is absent.
pub fn apply(crucible_dir: &Path) -> Result<bool> {
    let outcome_path = crucible_dir.join(OUTCOME_REPORT);
    let Some(mut report) = read_report::<OutcomeReport>(&outcome_path)? else {
        return Ok(false);
    };
    let trace = read_report::<RuntimeTrace>(&crucible_dir.join(PROBE_REPORT))?;
    if trace.is_none() && report.finals.is_empty() {
        return Ok(false);
    }
    reconcile(&mut report, trace.as_ref());
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize outcome report")?;
    write_atomic(&outcome_path, json.as_bytes())
        .with_context(|| format!("Failed to write {}", outcome_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn probe(method: &str, endpoint: &str, passed: bool) -> Probe {
        Probe {
            method: method.into(),
            endpoint: endpoint.into(),
            passed,
            actual_status: Some(if passed { 200 } else { 404 }),
            expected_status: Some(200),
            missing_fields: Vec::new(),
        }
    }

    fn trace(probes: Vec<Probe>) -> RuntimeTrace {
        RuntimeTrace {
            probes,
            summary: None,
        }
    }

    #[test]
    fn test_endpoint_key_normalizes() {
        assert_eq!(endpoint_key("get", "/users/?page=2"), "GET /users");
        assert_eq!(endpoint_key("POST", "/"), "POST /");
        assert_eq!(
            label_endpoint("get /users/: list all users").as_deref(),
            Some("GET /users")
        );
        assert_eq!(label_endpoint("Users can sign up"), None);
    }

    #[test]
    fn test_probe_overrides_heuristic_verdicts() {
        let mut report = OutcomeReport {
            coverage: Some(50.0),
            met: vec!["GET /orders".into(), "Login page".into()],
            unmet: vec!["GET /users: not implemented".into(), "Export".into()],
            ..Default::default()
        };
        let trace = trace(vec![probe("GET", "/users", true), probe("GET", "/orders", false)]);

        assert_eq!(reconcile(&mut report, Some(&trace)), 2);
        assert_eq!(report.met, vec!["Login page", "GET /users"]);
        assert_eq!(
            report.unmet,
            vec!["Export", "GET /orders -> 404 (expected 200)"]
        );
        assert_eq!(report.coverage, Some(50.0));
        assert_eq!(report.finals.get("GET /users"), Some(&true));
    }

    #[test]
    fn test_final_verdict_survives_heuristic_reevaluation() {
        let mut report = OutcomeReport {
            met: vec!["Signup".into()],
            unmet: vec!["GET /health: seems broken".into()],
            ..Default::default()
        };
        report.finals.insert("GET /health".into(), true);

        reconcile(&mut report, None);
        assert_eq!(report.met, vec!["Signup", "GET /health"]);
        assert!(report.unmet.is_empty());
        assert_eq!(report.coverage, Some(100.0));
    }

    #[test]
    fn test_no_probes_leaves_report_untouched() {
        let mut report = OutcomeReport {
            coverage: Some(85.0),
            met: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(reconcile(&mut report, Some(&trace(Vec::new()))), 0);
        assert_eq!(report.coverage, Some(85.0));
    }

    #[test]
    fn test_apply_rewrites_report_on_disk() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(OUTCOME_REPORT),
            r#"{"coverage": 0, "met": [], "unmet": ["POST /items: missing"], "summary": "kept"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(PROBE_REPORT),
            r#"{"probes": [{"method": "POST", "endpoint": "/items", "passed": true}]}"#,
        )
        .unwrap();

        assert!(apply(dir.path()).unwrap());
        let report: OutcomeReport = read_report(&dir.path().join(OUTCOME_REPORT))
            .unwrap()
            .unwrap();
        assert_eq!(report.coverage, Some(100.0));
        assert_eq!(report.extra["summary"], "kept");
        assert_eq!(report.finals.get("POST /items"), Some(&true));
    }

    #[test]
    fn test_apply_without_outcome_report() {
        let dir = tempdir().unwrap();
        assert!(!apply(dir.path()).unwrap());
    }
}
