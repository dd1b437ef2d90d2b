use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::crucible_config::CrucibleToml;

/// Working directory for everything Crucible writes.
pub const CRUCIBLE_DIR: &str = ".crucible";

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_iterations: Option<u32>,
    pub coverage: Option<f64>,
}

/// Runtime configuration for Crucible.
///
/// Built once at startup from `crucible.toml`, the environment and CLI
/// flags, then passed by reference to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub crucible_dir: PathBuf,
    pub requirements_file: PathBuf,
    pub instructions_file: PathBuf,
    pub learnings_file: PathBuf,
    pub groups_dir: PathBuf,
    pub lock_file: PathBuf,
    pub event_file: PathBuf,
    pub decision_file: PathBuf,
    pub audit_dir: PathBuf,
    pub log_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub verbose: bool,
    /// Warnings collected while layering configuration
    pub warnings: Vec<String>,
    settings: CrucibleToml,
}

impl Config {
    /// Build the configuration from the real process environment.
    pub fn new(project_dir: PathBuf, verbose: bool, overrides: &CliOverrides) -> Result<Self> {
        Self::with_env(project_dir, verbose, overrides, std::env::vars())
    }

    /// Build the configuration from an explicit set of environment variables.
    pub fn with_env<I>(
        project_dir: PathBuf,
        verbose: bool,
        overrides: &CliOverrides,
        env: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let mut settings = CrucibleToml::load_or_default(&project_dir)?;
        let mut warnings = settings.apply_env_overrides(env)?;
        if let Some(max) = overrides.max_iterations {
            settings.iteration.max_iterations = max;
        }
        if let Some(coverage) = overrides.coverage {
            settings.quality.coverage = coverage;
        }
        warnings.extend(settings.validate());

        Ok(Self::from_settings(project_dir, verbose, settings, warnings))
    }

    fn from_settings(
        project_dir: PathBuf,
        verbose: bool,
        settings: CrucibleToml,
        warnings: Vec<String>,
    ) -> Self {
        let crucible_dir = project_dir.join(CRUCIBLE_DIR);
        Self {
            requirements_file: project_dir.join(&settings.project.requirements),
            instructions_file: project_dir.join(&settings.project.instructions),
            learnings_file: project_dir.join(&settings.project.learnings),
            groups_dir: project_dir.join(&settings.project.groups_dir),
            lock_file: crucible_dir.join("runner.pid"),
            event_file: crucible_dir.join("event-stream.jsonl"),
            decision_file: crucible_dir.join("decisions.jsonl"),
            audit_dir: crucible_dir.join("audit"),
            log_dir: crucible_dir.join("logs"),
            iterations_dir: crucible_dir.join("iterations"),
            crucible_dir,
            project_dir,
            verbose,
            warnings,
            settings,
        }
    }

    /// Configuration with defaults only, rooted at `project_dir` as given.
    pub fn with_defaults(project_dir: &Path) -> Self {
        Self::from_settings(
            project_dir.to_path_buf(),
            false,
            CrucibleToml::default(),
            Vec::new(),
        )
    }

    pub fn settings(&self) -> &CrucibleToml {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut CrucibleToml {
        &mut self.settings
    }

    /// Path of a report file under `.crucible/`.
    pub fn report_path(&self, name: &str) -> PathBuf {
        self.crucible_dir.join(name)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.crucible_dir)
            .context("Failed to create .crucible directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.audit_dir.join("runs"))
            .context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.iterations_dir)
            .context("Failed to create iterations directory")?;
        Ok(())
    }
}
