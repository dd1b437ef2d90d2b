use super::{AuditRun, IterationAudit, RunConfig};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<AuditRun>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join("current-run.json");
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    pub fn start_run(&mut self, config: RunConfig) -> Result<()> {
        let run = AuditRun::new(config);
        self.current_run = Some(run);
        self.save_current()?;
        Ok(())
    }

    /// Append one iteration to the current run and persist it.
    ///
    /// Returns an error if no run is active.
    pub fn add_iteration(&mut self, iteration: IterationAudit) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("add_iteration called with no active run"))?;
        run.iterations.push(iteration);
        self.save_current()
    }

    /// Move the current run into `runs/` and return its path.
    pub fn finish_run(&mut self, stop_reason: Option<String>) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish(stop_reason);

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let run_file = self.audit_dir.join("runs").join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize audit run")?;
        write_atomic(&run_file, json.as_bytes()).context("Failed to write audit run file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            write_atomic(&self.current_run_file, json.as_bytes())
                .context("Failed to write current run file")?;
        }
        Ok(())
    }

    /// Load an unfinished run left behind by an interrupted invocation.
    pub fn load_current(&mut self) -> Result<bool> {
        if self.current_run_file.exists() {
            let content = fs::read_to_string(&self.current_run_file)
                .context("Failed to read current run file")?;
            let run: AuditRun =
                serde_json::from_str(&content).context("Failed to parse current run file")?;
            self.current_run = Some(run);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn current_run(&self) -> Option<&AuditRun> {
        self.current_run.as_ref()
    }

    /// Finished run files, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.audit_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<AuditRun> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let run: AuditRun =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Counts;
    use crate::gates::reports::Reports;
    use crate::gates::{Thresholds, evaluate};
    use crate::phase::PipelineRun;
    use tempfile::TempDir;

    fn setup_logger() -> (AuditLogger, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let logger = AuditLogger::new(dir.path());
        (logger, dir)
    }

    fn make_run_config() -> RunConfig {
        RunConfig {
            project_dir: PathBuf::from("."),
            agent_cmd: "claude".into(),
            max_iterations: 3,
            thresholds: Thresholds::default(),
            verbose: false,
        }
    }

    fn make_iteration(n: u32) -> IterationAudit {
        let gates = evaluate(&Reports::default(), &Counts::default(), &Thresholds::default());
        IterationAudit::new(&PipelineRun::new(n), Counts::default(), gates)
    }

    #[test]
    fn test_add_iteration_without_active_run_returns_err() {
        let (mut logger, _dir) = setup_logger();
        assert!(logger.add_iteration(make_iteration(1)).is_err());
    }

    #[test]
    fn test_start_run_creates_current_run_file() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(make_run_config()).unwrap();
        assert!(dir.path().join("current-run.json").exists());
    }

    #[test]
    fn test_iterations_persisted_to_current_run() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(make_run_config()).unwrap();
        logger.add_iteration(make_iteration(1)).unwrap();
        logger.add_iteration(make_iteration(2)).unwrap();

        let mut second = AuditLogger::new(dir.path());
        assert!(second.load_current().unwrap());
        assert_eq!(second.current_run().unwrap().iterations.len(), 2);
    }

    #[test]
    fn test_finish_run_writes_run_file() {
        let (mut logger, dir) = setup_logger();
        logger.start_run(make_run_config()).unwrap();
        logger.add_iteration(make_iteration(1)).unwrap();
        let run_path = logger.finish_run(Some("cap_exhausted".into())).unwrap();

        assert!(!dir.path().join("current-run.json").exists());
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&run_path).unwrap()).unwrap();
        assert_eq!(value["run_id"].as_str().unwrap().len(), 36);
        assert_eq!(value["stop_reason"], "cap_exhausted");
        assert!(!value["ended_at"].is_null());
        assert_eq!(value["iterations"].as_array().unwrap().len(), 1);

        let runs = logger.list_runs().unwrap();
        assert_eq!(runs, vec![run_path.clone()]);
        assert_eq!(logger.load_run(&run_path).unwrap().iterations[0].iteration, 1);
    }

    #[test]
    fn test_list_runs_empty_without_directory() {
        let (logger, _dir) = setup_logger();
        assert!(logger.list_runs().unwrap().is_empty());
    }
}
