use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use git2::{Repository, Sort, StatusOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One commit as written to the build record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub author: String,
    pub time: DateTime<Utc>,
    pub summary: String,
}

impl CommitSummary {
    /// `"<short sha> <time> <author>: <summary>"`
    pub fn log_line(&self) -> String {
        format!(
            "{} {} {}: {}",
            &self.sha[..self.sha.len().min(8)],
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.author,
            self.summary
        )
    }
}

/// Read-only view of the project's git history.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Up to `limit` commits reachable from HEAD, newest first.
    pub fn recent_commits(&self, limit: usize) -> Result<Vec<CommitSummary>> {
        if self.get_head_commit().is_none() {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            let commit = self.repo.find_commit(oid?)?;
            let time = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_default();
            commits.push(CommitSummary {
                sha: commit.id().to_string(),
                author: commit.author().name().unwrap_or("unknown").to_string(),
                time,
                summary: commit.summary().unwrap_or("").to_string(),
            });
        }
        Ok(commits)
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn uncommitted_paths(&self) -> Result<Vec<PathBuf>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let tracker = GitTracker::new(dir.path()).unwrap();
        (tracker, dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("agent", "agent@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_not_a_repository() {
        let dir = tempdir().unwrap();
        assert!(GitTracker::new(dir.path()).is_err());
    }

    #[test]
    fn test_unborn_branch_has_no_commits() {
        let (tracker, _dir) = setup_repo();
        assert!(tracker.head_sha().is_none());
        assert!(tracker.recent_commits(20).unwrap().is_empty());
    }

    #[test]
    fn test_recent_commits_newest_first_with_limit() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "1", "first");
        commit_file(dir.path(), "a.txt", "2", "second");
        commit_file(dir.path(), "a.txt", "3", "third");

        let commits = tracker.recent_commits(2).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].summary, "third");
        assert_eq!(commits[0].author, "agent");
        assert_eq!(commits[0].sha, tracker.head_sha().unwrap());
        assert!(commits[0].log_line().ends_with("agent: third"));
    }

    #[test]
    fn test_uncommitted_paths_include_untracked() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "1", "first");
        fs::write(dir.path().join("a.txt"), "changed").unwrap();
        fs::write(dir.path().join("new.txt"), "x").unwrap();

        let mut paths = tracker.uncommitted_paths().unwrap();
        paths.sort();
        assert_eq!(paths, vec![PathBuf::from("a.txt"), PathBuf::from("new.txt")]);
    }
}
