//! Configuration view and validation commands: `crucible config`.

use anyhow::{Context, Result};
use std::path::PathBuf;

use super::super::ConfigCommands;
use super::CrucibleExit;

pub fn cmd_config(project_dir: PathBuf, command: Option<ConfigCommands>) -> Result<CrucibleExit> {
    use crucible::config::{CliOverrides, Config};
    use crucible::crucible_config::{CONFIG_FILE, CrucibleToml};

    let config_path = project_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Crucible Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, using defaults", CONFIG_FILE);
            }
            println!();

            // Effective values, after environment overrides.
            let config = Config::new(project_dir, false, &CliOverrides::default())?;
            let rendered = toml::to_string_pretty(config.settings())
                .context("Failed to render configuration")?;
            println!("{}", rendered);
            for warning in &config.warnings {
                println!("warning: {}", warning);
            }
            Ok(CrucibleExit::Success)
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(CrucibleExit::Success);
            }

            let toml = CrucibleToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
                Ok(CrucibleExit::Success)
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                Ok(CrucibleExit::Unmet)
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            CrucibleToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
            Ok(CrucibleExit::Success)
        }
    }
}
