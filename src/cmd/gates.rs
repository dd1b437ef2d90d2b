//! Gate evaluation without a run: `crucible gates`.

use anyhow::Result;
use console::style;
use crucible::gates::GateReport;
use crucible::ui::icons::{CHECK, CROSS, SKIP};
use std::path::PathBuf;

use super::CrucibleExit;

pub fn cmd_gates(project_dir: PathBuf, coverage: Option<f64>) -> Result<CrucibleExit> {
    use crucible::config::{CliOverrides, Config};
    use crucible::features::FeatureStore;
    use crucible::gates::evaluate_project;

    let overrides = CliOverrides {
        max_iterations: None,
        coverage,
    };
    let config = Config::new(project_dir, false, &overrides)?;
    let store = FeatureStore::new(
        &config.groups_dir,
        config.settings().build.max_cycles_per_feature,
    );
    let report = evaluate_project(&config, &store);
    print_report(&report);

    Ok(if report.passed {
        CrucibleExit::Success
    } else {
        CrucibleExit::Unmet
    })
}

pub fn print_report(report: &GateReport) {
    println!("{}", style("Quality gates").bold());
    for gate in &report.gates {
        let (icon, name) = if gate.skipped {
            (SKIP, style(gate.name.as_str()).dim())
        } else if gate.passed {
            (CHECK, style(gate.name.as_str()).green())
        } else {
            (CROSS, style(gate.name.as_str()).red())
        };
        println!("  {}{:<10} {}", icon, name, gate.detail);
    }
    let verdict = if report.passed {
        style("PASS").green().bold()
    } else {
        style("FAIL").red().bold()
    };
    println!(
        "Result: {} (verification completeness {:.0}%)",
        verdict, report.completeness
    );
}
