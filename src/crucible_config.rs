//! File configuration for Crucible.
//!
//! Settings are read from `crucible.toml` at the project root and layered:
//! defaults → file → environment (`CRUCIBLE_<SECTION>_<KEY>`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! requirements = "context/prd.md"
//! instructions = "AGENTS.md"
//! groups_dir = "context/groups"
//!
//! [build]
//! agent_cmd = "claude"
//! agent_args = ["--dangerously-skip-permissions", "-p"]
//! timeout_stall_minutes = 12
//! timeout_absolute_minutes = 20
//! max_cycles_per_feature = 5
//!
//! [quality]
//! coverage = 80
//! features_pass_rate = 80
//!
//! [iteration]
//! max_iterations = 5
//! stagnation_window = 2
//!
//! [tools]
//! outcome = "python3 tools/outcome.py"
//!
//! [timeouts]
//! outcome = 120
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file at the project root.
pub const CONFIG_FILE: &str = "crucible.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CRUCIBLE_";

/// Where the project's documents live, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Requirements document the agent builds from
    #[serde(default = "default_requirements")]
    pub requirements: String,
    /// Agent instruction file that receives shared context
    #[serde(default = "default_instructions")]
    pub instructions: String,
    /// Directory holding one subdirectory per work group
    #[serde(default = "default_groups_dir")]
    pub groups_dir: String,
    /// Accumulated learnings injected into the instruction file
    #[serde(default = "default_learnings")]
    pub learnings: String,
}

fn default_requirements() -> String {
    "context/prd.md".to_string()
}

fn default_instructions() -> String {
    "AGENTS.md".to_string()
}

fn default_groups_dir() -> String {
    "context/groups".to_string()
}

fn default_learnings() -> String {
    "context/learnings.md".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            requirements: default_requirements(),
            instructions: default_instructions(),
            groups_dir: default_groups_dir(),
            learnings: default_learnings(),
        }
    }
}

/// Build phase: the agent subprocess and its monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Instruction passed as the agent's final argument
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default = "default_stall_minutes")]
    pub timeout_stall_minutes: u64,
    #[serde(default = "default_absolute_minutes")]
    pub timeout_absolute_minutes: u64,
    #[serde(default = "default_max_cycles")]
    pub max_cycles_per_feature: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Unresolved seconds before an item gets a stall warning
    #[serde(default = "default_item_warn")]
    pub item_warn_secs: u64,
    /// Unresolved seconds before an item is force-advanced
    #[serde(default = "default_item_force")]
    pub item_force_secs: u64,
    /// Completion percentage above which the stall timeout applies
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_pct: f64,
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".to_string(),
        "-p".to_string(),
    ]
}

fn default_instruction() -> String {
    "Read AGENTS.md and implement every pending feature in context/groups. \
     Report progress with `crucible feature pass <id> --group <group>` and \
     `crucible feature attempt <id> --group <group>`."
        .to_string()
}

fn default_stall_minutes() -> u64 {
    12
}

fn default_absolute_minutes() -> u64 {
    20
}

fn default_max_cycles() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    2
}

fn default_kill_grace() -> u64 {
    10
}

fn default_item_warn() -> u64 {
    300
}

fn default_item_force() -> u64 {
    480
}

fn default_stall_threshold() -> f64 {
    80.0
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            agent_cmd: default_agent_cmd(),
            agent_args: default_agent_args(),
            instruction: default_instruction(),
            timeout_stall_minutes: default_stall_minutes(),
            timeout_absolute_minutes: default_absolute_minutes(),
            max_cycles_per_feature: default_max_cycles(),
            poll_interval_secs: default_poll_interval(),
            kill_grace_secs: default_kill_grace(),
            item_warn_secs: default_item_warn(),
            item_force_secs: default_item_force(),
            stall_threshold_pct: default_stall_threshold(),
        }
    }
}

/// Quality gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySection {
    #[serde(default = "default_coverage")]
    pub coverage: f64,
    #[serde(default = "default_true")]
    pub tests_pass: bool,
    #[serde(default = "default_features_pass_rate")]
    pub features_pass_rate: f64,
    #[serde(default = "default_visual_score")]
    pub visual_score: f64,
    #[serde(default = "default_probe_pass_rate")]
    pub probe_pass_rate: f64,
}

fn default_coverage() -> f64 {
    80.0
}

fn default_true() -> bool {
    true
}

fn default_features_pass_rate() -> f64 {
    80.0
}

fn default_visual_score() -> f64 {
    70.0
}

fn default_probe_pass_rate() -> f64 {
    70.0
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            coverage: default_coverage(),
            tests_pass: true,
            features_pass_rate: default_features_pass_rate(),
            visual_score: default_visual_score(),
            probe_pass_rate: default_probe_pass_rate(),
        }
    }
}

/// Autonomous iteration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Consecutive non-improving iterations that stop the loop
    #[serde(default = "default_stagnation_window")]
    pub stagnation_window: usize,
    /// Optional external requirements improver, fed feedback JSON on stdin
    #[serde(default)]
    pub improver_cmd: String,
    #[serde(default = "default_improver_timeout")]
    pub improver_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_stagnation_window() -> usize {
    2
}

fn default_improver_timeout() -> u64 {
    300
}

impl Default for IterationSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stagnation_window: default_stagnation_window(),
            improver_cmd: String::new(),
            improver_timeout_secs: default_improver_timeout(),
        }
    }
}

/// External tool commands. An empty command skips the phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default)]
    pub spec_review: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub smoke: String,
    #[serde(default)]
    pub visual: String,
    #[serde(default)]
    pub probes: String,
    #[serde(default)]
    pub learnings: String,
    /// Overrides test-runner detection
    #[serde(default)]
    pub tests: String,
}

/// Per-phase timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_120")]
    pub spec_review: u64,
    #[serde(default = "default_30")]
    pub context: u64,
    #[serde(default = "default_120")]
    pub tests: u64,
    #[serde(default = "default_120")]
    pub outcome: u64,
    #[serde(default = "default_60")]
    pub smoke: u64,
    #[serde(default = "default_180")]
    pub visual: u64,
    #[serde(default = "default_120")]
    pub probes: u64,
    #[serde(default = "default_60")]
    pub learnings: u64,
    #[serde(default = "default_30")]
    pub build_record: u64,
}

fn default_30() -> u64 {
    30
}

fn default_60() -> u64 {
    60
}

fn default_120() -> u64 {
    120
}

fn default_180() -> u64 {
    180
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            spec_review: 120,
            context: 30,
            tests: 120,
            outcome: 120,
            smoke: 60,
            visual: 180,
            probes: 120,
            learnings: 60,
            build_record: 30,
        }
    }
}

/// The complete `crucible.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrucibleToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub iteration: IterationSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl CrucibleToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crucible.toml")
    }

    /// Load `crucible.toml` from the project root, or defaults when absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize crucible.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CRUCIBLE_<SECTION>_<KEY>` overrides.
    ///
    /// Values are parsed as TOML literals first (`12`, `true`, `["a", "b"]`)
    /// and fall back to a plain string. Unknown sections and keys are
    /// returned as warnings and ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut warnings = Vec::new();
        let serialized = toml::to_string(self).context("Failed to serialize configuration")?;
        let mut table: toml::Table =
            toml::from_str(&serialized).context("Failed to re-read configuration")?;
        let mut changed = false;

        for (name, raw) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let rest = rest.to_lowercase();
            let Some((section, key)) = rest.split_once('_') else {
                continue;
            };
            let Some(toml::Value::Table(section_table)) = table.get_mut(section) else {
                // Variables like CRUCIBLE_LOG are not configuration overrides.
                continue;
            };
            let Some(existing) = section_table.get(key) else {
                warnings.push(format!("Unknown configuration key in {}: {}", name, key));
                continue;
            };
            let value = parse_env_value(&raw, existing);
            if value.type_str() != existing.type_str() {
                warnings.push(format!(
                    "Ignoring {}: expected {}, got '{}'",
                    name,
                    existing.type_str(),
                    raw
                ));
                continue;
            }
            section_table.insert(key.to_string(), value);
            changed = true;
        }

        if changed {
            let rendered = toml::to_string(&table).context("Failed to render overrides")?;
            *self = toml::from_str(&rendered).context("Invalid environment override")?;
        }
        Ok(warnings)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.build.agent_cmd.trim().is_empty() {
            warnings.push("build.agent_cmd is empty; the build phase cannot start".to_string());
        }
        if self.build.max_cycles_per_feature == 0 {
            warnings.push("build.max_cycles_per_feature must be at least 1".to_string());
        }
        if self.build.item_force_secs <= self.build.item_warn_secs {
            warnings.push(format!(
                "build.item_force_secs ({}) should exceed build.item_warn_secs ({})",
                self.build.item_force_secs, self.build.item_warn_secs
            ));
        }
        if self.build.timeout_stall_minutes > self.build.timeout_absolute_minutes {
            warnings.push(format!(
                "build.timeout_stall_minutes ({}) exceeds timeout_absolute_minutes ({}) and will never fire",
                self.build.timeout_stall_minutes, self.build.timeout_absolute_minutes
            ));
        }
        for (name, value) in [
            ("quality.coverage", self.quality.coverage),
            ("quality.features_pass_rate", self.quality.features_pass_rate),
            ("quality.visual_score", self.quality.visual_score),
            ("quality.probe_pass_rate", self.quality.probe_pass_rate),
        ] {
            if !(0.0..=100.0).contains(&value) {
                warnings.push(format!("{} = {} is outside 0..=100", name, value));
            }
        }
        if self.iteration.max_iterations == 0 {
            warnings.push("iteration.max_iterations must be at least 1".to_string());
        }
        if self.iteration.stagnation_window == 0 {
            warnings.push("iteration.stagnation_window must be at least 1".to_string());
        }

        warnings
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.build.timeout_stall_minutes * 60)
    }

    pub fn absolute_timeout(&self) -> Duration {
        Duration::from_secs(self.build.timeout_absolute_minutes * 60)
    }
}

fn parse_env_value(raw: &str, existing: &toml::Value) -> toml::Value {
    if let toml::Value::String(_) = existing {
        return toml::Value::String(raw.to_string());
    }
    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("v"));
    match (parsed, existing) {
        // `coverage = 85` should still land in a float field.
        (Some(toml::Value::Integer(i)), toml::Value::Float(_)) => toml::Value::Float(i as f64),
        (Some(value), _) => value,
        (None, _) => toml::Value::String(raw.to_string()),
    }
}
