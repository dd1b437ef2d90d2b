//! Runs the generated project's own test suite.

use super::process::run_bounded;
use crate::gates::reports::{TEST_RESULTS, TestResults};
use crate::phase::{PhaseContext, PhaseExecutor, PhaseResult};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

static PASSED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:passed|passing)").unwrap());
static FAILED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:failed|failing)").unwrap());
static FAILURE_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAILED (\S+)|test (\S+) \.\.\. FAILED)").unwrap());

const MAX_OUTPUT_CHARS: usize = 8_000;
const MAX_FAILURES: usize = 20;

/// Placeholder script `npm init` writes; not a real suite.
const NPM_PLACEHOLDER: &str = "no test specified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub framework: String,
    pub command: String,
}

/// Pick the project's test runner: pytest, then npm, then cargo.
pub fn detect(project_dir: &Path) -> Option<TestCommand> {
    let pattern = project_dir.join("tests/**/test_*.py");
    let has_pytest = glob::glob(&pattern.to_string_lossy())
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false);
    if has_pytest {
        return Some(TestCommand {
            framework: "pytest".into(),
            command: "python3 -m pytest -v --tb=short".into(),
        });
    }

    if let Ok(content) = std::fs::read_to_string(project_dir.join("package.json"))
        && let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&content)
        && let Some(script) = pkg["scripts"]["test"].as_str()
        && !script.contains(NPM_PLACEHOLDER)
    {
        return Some(TestCommand {
            framework: "npm".into(),
            command: "npm test".into(),
        });
    }

    if project_dir.join("Cargo.toml").exists() {
        return Some(TestCommand {
            framework: "cargo".into(),
            command: "cargo test".into(),
        });
    }
    None
}

/// Parse pass/fail counts and failing test names from runner output.
///
/// Counts are summed across summary lines (cargo prints one per test
/// binary).
pub fn parse_output(output: &str) -> (u64, u64, Vec<String>) {
    let sum = |re: &Regex| -> u64 {
        re.captures_iter(output)
            .filter_map(|c| c[1].parse::<u64>().ok())
            .sum()
    };
    let failures = output
        .lines()
        .filter_map(|line| {
            let caps = FAILURE_LINE_REGEX.captures(line.trim_start())?;
            caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
        })
        .take(MAX_FAILURES)
        .collect();
    (sum(&PASSED_REGEX), sum(&FAILED_REGEX), failures)
}

fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

pub struct ProjectTestsPhase {
    command: String,
    timeout: Duration,
}

impl ProjectTestsPhase {
    /// `command` overrides detection when non-empty.
    pub fn new(command: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.trim().to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl PhaseExecutor for ProjectTestsPhase {
    fn name(&self) -> &str {
        "tests"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout + Duration::from_secs(5))
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseResult> {
        let config = &ctx.config;
        let report_path = config.report_path(TEST_RESULTS);
        let selected = if self.command.is_empty() {
            detect(&config.project_dir)
        } else {
            Some(TestCommand {
                framework: "custom".into(),
                command: self.command.clone(),
            })
        };

        let Some(selected) = selected else {
            let results = TestResults::default();
            write_results(&report_path, &results)?;
            return Ok(PhaseResult::skip("no test suite detected"));
        };
        debug!(framework = %selected.framework, "running project tests");

        let out = run_bounded(
            &selected.command,
            &config.project_dir,
            self.timeout,
            None,
            &[],
        )
        .await?;
        let combined = format!("{}{}", out.stdout, out.stderr);
        let (passed, mut failed, mut failures) = parse_output(&combined);
        if out.exit_code != 0 && !out.timed_out && failed == 0 {
            failed = 1;
            failures.push(format!("test command exited with code {}", out.exit_code));
        }

        let results = TestResults {
            framework: Some(selected.framework.clone()),
            exit_code: out.exit_code,
            passed,
            failed,
            output: if out.timed_out {
                format!("Test execution timed out after {}s", self.timeout.as_secs())
            } else {
                tail(&combined, MAX_OUTPUT_CHARS)
            },
            failures,
        };
        write_results(&report_path, &results)?;

        let summary = format!(
            "{}: {} passed, {} failed",
            selected.framework, results.passed, results.failed
        );
        if out.timed_out {
            Ok(PhaseResult::fail(format!(
                "{} timed out after {}s",
                selected.framework,
                self.timeout.as_secs()
            )))
        } else if results.failed == 0 && results.passed > 0 {
            Ok(PhaseResult::pass(summary))
        } else {
            Ok(PhaseResult::fail(summary))
        }
    }
}

fn write_results(path: &Path, results: &TestResults) -> Result<()> {
    let json = serde_json::to_string_pretty(results).context("Failed to serialize test results")?;
    write_atomic(path, json.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gates::reports::read_report;
    use crate::phase::PhaseOutcome;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_detect_prefers_pytest() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests/unit")).unwrap();
        std::fs::write(dir.path().join("tests/unit/test_api.py"), "").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(detect(dir.path()).unwrap().framework, "pytest");
    }

    #[test]
    fn test_detect_npm_ignores_placeholder_script() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        assert_eq!(detect(dir.path()), None);

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest"}}"#,
        )
        .unwrap();
        assert_eq!(detect(dir.path()).unwrap().command, "npm test");
    }

    #[test]
    fn test_parse_pytest_summary() {
        let output = "tests/test_a.py::test_ok PASSED\n\
                      FAILED tests/test_a.py::test_bad - assert 1 == 2\n\
                      ===== 4 passed, 1 failed in 0.12s =====\n";
        let (passed, failed, failures) = parse_output(output);
        assert_eq!((passed, failed), (4, 1));
        assert_eq!(failures, vec!["tests/test_a.py::test_bad"]);
    }

    #[test]
    fn test_parse_cargo_sums_binaries() {
        let output = "test api::works ... ok\n\
                      test api::breaks ... FAILED\n\
                      test result: FAILED. 3 passed; 1 failed; 0 ignored\n\
                      test result: ok. 2 passed; 0 failed; 0 ignored\n";
        let (passed, failed, failures) = parse_output(output);
        assert_eq!((passed, failed), (5, 1));
        assert_eq!(failures, vec!["api::breaks"]);
    }

    #[tokio::test]
    async fn test_phase_with_configured_command() {
        let dir = tempdir().unwrap();
        let ctx = PhaseContext::new(Arc::new(Config::with_defaults(dir.path())), 1);
        let phase = ProjectTestsPhase::new("echo '7 passed in 0.5s'", 10);

        let result = phase.execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, PhaseOutcome::Pass, "{}", result.message);

        let results: TestResults = read_report(&ctx.config.report_path(TEST_RESULTS))
            .unwrap()
            .unwrap();
        assert_eq!(results.framework.as_deref(), Some("custom"));
        assert_eq!(results.passed, 7);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_counts_is_a_failure() {
        let dir = tempdir().unwrap();
        let ctx = PhaseContext::new(Arc::new(Config::with_defaults(dir.path())), 1);
        let result = ProjectTestsPhase::new("exit 2", 10)
            .execute(&ctx)
            .await
            .unwrap();
        assert_eq!(result.outcome, PhaseOutcome::Fail);

        let results: TestResults = read_report(&ctx.config.report_path(TEST_RESULTS))
            .unwrap()
            .unwrap();
        assert_eq!(results.failed, 1);
    }

    #[tokio::test]
    async fn test_nothing_detected_skips() {
        let dir = tempdir().unwrap();
        let ctx = PhaseContext::new(Arc::new(Config::with_defaults(dir.path())), 1);
        let result = ProjectTestsPhase::new("", 10).execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, PhaseOutcome::Skip);
    }
}
