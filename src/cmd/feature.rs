//! Work-item transitions reported by the agent: `crucible feature`.

use anyhow::Result;
use std::path::PathBuf;

use super::super::FeatureCommands;
use super::CrucibleExit;

pub fn cmd_feature(project_dir: PathBuf, command: FeatureCommands) -> Result<CrucibleExit> {
    use crucible::config::{CliOverrides, Config};
    use crucible::events::EventStream;
    use crucible::features::{AttemptCause, FeatureStore, Transition};

    let config = Config::new(project_dir, false, &CliOverrides::default())?;
    let store = FeatureStore::new(
        &config.groups_dir,
        config.settings().build.max_cycles_per_feature,
    )
    .with_events(EventStream::new(&config.event_file));

    let resolve = |id: &str, group: Option<String>| -> Result<String> {
        match group {
            Some(g) => Ok(g),
            None => store.find_group(id).ok_or_else(|| {
                anyhow::anyhow!(
                    "Work item '{}' not found in exactly one group; pass --group",
                    id
                )
            }),
        }
    };

    let (key, transition) = match command {
        FeatureCommands::Attempt { id, group } => {
            let group = resolve(&id, group)?;
            let t = store.attempt(&group, &id, AttemptCause::Reported)?;
            (format!("{}/{}", group, id), t)
        }
        FeatureCommands::Pass {
            id,
            group,
            evidence,
        } => {
            let group = resolve(&id, group)?;
            let t = store.pass(&group, &id, evidence.as_deref())?;
            (format!("{}/{}", group, id), t)
        }
    };

    match transition {
        Transition::Failed { cycles } => println!("{}: failed (cycle {})", key, cycles),
        Transition::Blocked { cycles } => println!("{}: blocked after {} cycles", key, cycles),
        Transition::Passed => println!("{}: passed", key),
        Transition::AttemptIgnored { status } => {
            println!("{}: already {}, attempt ignored", key, status)
        }
        Transition::PassRejected => println!("{}: blocked, pass rejected", key),
        Transition::AlreadyPassed => println!("{}: already passed", key),
    }
    Ok(CrucibleExit::Success)
}
