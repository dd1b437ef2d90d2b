//! Decision log and recorded runs: `crucible audit`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use std::path::PathBuf;

use super::CrucibleExit;

pub struct AuditArgs {
    pub kind: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub iteration: Option<u32>,
}

fn parse_time(flag: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid --{} timestamp '{}' (expected RFC 3339)", flag, v))
        })
        .transpose()
}

pub fn cmd_audit(project_dir: PathBuf, args: AuditArgs) -> Result<CrucibleExit> {
    use crucible::audit::AuditLogger;
    use crucible::config::{CliOverrides, Config};
    use crucible::decisions::{DecisionKind, DecisionLog};

    let config = Config::new(project_dir, false, &CliOverrides::default())?;
    let kind = args
        .kind
        .as_deref()
        .map(str::parse::<DecisionKind>)
        .transpose()?;
    let since = parse_time("since", args.since.as_deref())?;
    let until = parse_time("until", args.until.as_deref())?;

    let log = DecisionLog::new(&config.decision_file);
    let scoped: Vec<_> = match args.iteration {
        Some(i) => log
            .for_iteration(i)?
            .into_iter()
            .filter(|d| d.within(since, until))
            .collect(),
        None => log.in_range(since, until)?,
    };
    let decisions: Vec<_> = scoped
        .into_iter()
        .filter(|d| kind.is_none_or(|k| d.kind == k))
        .collect();

    println!();
    println!("{}", style("Decisions").bold());
    if decisions.is_empty() {
        println!("  (none)");
    }
    for d in &decisions {
        println!(
            "  [{}] iteration {} {} {}: {}",
            d.timestamp.format("%Y-%m-%d %H:%M:%S"),
            d.iteration,
            style(d.kind).cyan(),
            d.target,
            d.decision
        );
        if !d.rationale.is_empty() {
            println!("      {}", style(&d.rationale).dim());
        }
    }

    let audit = AuditLogger::new(&config.audit_dir);
    let runs = audit.list_runs()?;
    println!();
    println!("{}", style("Runs").bold());
    if runs.is_empty() {
        println!("  (none)");
    }
    for path in &runs {
        let run = audit.load_run(path)?;
        let passed = run.iterations.last().map(|i| i.gates.passed).unwrap_or(false);
        println!(
            "  {} {} {} iteration(s), stopped: {}, gates {}",
            &run.run_id.to_string()[..8],
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.iterations.len(),
            run.stop_reason.as_deref().unwrap_or("unfinished"),
            if passed { "passed" } else { "failed" }
        );
    }
    println!();

    Ok(CrucibleExit::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        let t = parse_time("since", Some("2026-01-02T03:04:05Z")).unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(parse_time("since", None).unwrap().is_none());
        assert!(parse_time("until", Some("yesterday")).is_err());
    }
}
