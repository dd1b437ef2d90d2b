//! Bounded subprocesses and process-group termination.
//!
//! Every child is started in its own process group so that a timeout or
//! cancellation takes down whatever the child spawned as well.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Exit code reported when the command could not be started at all.
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run `sh -c <command>` in `cwd` with a hard time bound.
///
/// A command that cannot be found yields exit code 127, not an error. On
/// timeout the whole process group is terminated and `timed_out` is set.
pub async fn run_bounded(
    command: &str,
    cwd: &Path,
    limit: Duration,
    stdin: Option<&str>,
    env: &[(&str, String)],
) -> Result<BoundedOutput> {
    debug!(command, timeout_secs = limit.as_secs(), "running bounded command");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn '{}': {}", command, e);
            return Ok(BoundedOutput {
                exit_code: EXIT_NOT_FOUND,
                stdout: String::new(),
                stderr: e.to_string(),
                timed_out: false,
            });
        }
    };

    let mut group = GroupGuard::new(&child);

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading its input is not an error.
        let _ = pipe.write_all(input.as_bytes()).await;
    }

    let stdout_task = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_task = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf).await;
            buf
        })
    });

    let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.with_context(|| format!("Failed to wait for '{}'", command))?;
            (status.code().unwrap_or(-1), false)
        }
        Err(_) => {
            warn!(
                "'{}' timed out after {}s, killing process group",
                command,
                limit.as_secs()
            );
            terminate_group(&mut child, Duration::from_secs(2)).await;
            (-1, true)
        }
    };
    group.disarm();

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(BoundedOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

/// SIGKILLs a child's process group if dropped while still armed.
///
/// `kill_on_drop` only reaches the group leader; this covers whatever it
/// spawned when the owning future is cancelled.
struct GroupGuard {
    pgid: Option<libc::pid_t>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().map(|pid| pid as libc::pid_t),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "bounded command dropped, killing process group");
            signal_group(pgid, libc::SIGKILL);
        }
    }
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL.
pub async fn terminate_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let pgid = pid as libc::pid_t;

    signal_group(pgid, libc::SIGTERM);
    if timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
    signal_group(pgid, libc::SIGKILL);
    if timeout(Duration::from_secs(5), child.wait()).await.is_err() {
        warn!(pgid, "process group still running after SIGKILL");
    }
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: killpg only delivers a signal; an invalid group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            pgid,
            signal,
            error = %std::io::Error::last_os_error(),
            "killpg failed"
        );
    }
}
