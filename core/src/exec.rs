//! Sandboxed shell execution for the exec toolset.
//!
//! Commands run with a purged environment, a workspace-validated working
//! directory, and rlimit-based resource caps applied in a pre-exec hook.
//! Output beyond 10 KiB is truncated head/tail; the full output is spilled
//! to the agent's tmp area.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::Result;
use crate::workspace::tmp_date_dir;

/// Combined cap on each of stdout/stderr kept in the tool return.
pub const MAX_EXEC_OUTPUT_BYTES: usize = 10 * 1024;

/// Hard ceiling on bytes read from a child stream, so a runaway process
/// cannot exhaust memory before truncation.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

const SPILL_SUBDIR: &str = "tool-output";

/// Resource caps applied to sandboxed child processes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    pub max_processes: u64,
    pub max_file_size_bytes: u64,
    pub max_cpu_seconds: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_processes: 64,
            max_file_size_bytes: 16 * 1024 * 1024,
            max_cpu_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
}

#[derive(Debug)]
pub struct ExecToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub truncated: bool,
    /// Where the untruncated stdout was spilled, when truncation fired.
    pub spill_path: Option<PathBuf>,
}

/// Run `params.command` through `sh -c` inside the sandbox.
pub async fn run_shell_command(
    params: ExecParams,
    limits: &SandboxLimits,
    tmp_dir: &Path,
) -> Result<ExecToolOutput> {
    let start = Instant::now();

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&params.command)
        .current_dir(&params.cwd)
        .env_clear()
        .envs(&params.env)
        // No stdin pipe: some tools try to read from it and hang forever.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_rlimits(&mut cmd, *limits);

    let mut child = cmd.spawn()?;
    let stdout_reader = child.stdout.take().ok_or_else(|| {
        io::Error::other("stdout pipe was unexpectedly not available")
    })?;
    let stderr_reader = child.stderr.take().ok_or_else(|| {
        io::Error::other("stderr pipe was unexpectedly not available")
    })?;

    let stdout_handle = tokio::spawn(read_capped(stdout_reader, MAX_CAPTURE_BYTES));
    let stderr_handle = tokio::spawn(read_capped(stderr_reader, MAX_CAPTURE_BYTES));

    let mut timed_out = false;
    let exit_code = match tokio::time::timeout(params.timeout, child.wait()).await {
        Ok(status) => status?.code().unwrap_or(-1),
        Err(_) => {
            child.start_kill()?;
            let _ = child.wait().await;
            timed_out = true;
            -1
        }
    };

    let stdout_bytes = stdout_handle.await??;
    let stderr_bytes = stderr_handle.await??;
    let full_stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let stderr = if timed_out {
        "Command timed out".to_string()
    } else {
        String::from_utf8_lossy(&stderr_bytes).into_owned()
    };

    let (stdout, truncated) = truncate_head_tail(&full_stdout);
    let spill_path = if truncated {
        Some(spill_full_output(tmp_dir, &full_stdout))
    } else {
        None
    };

    Ok(ExecToolOutput {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
        timed_out,
        truncated,
        spill_path,
    })
}

/// Keep the first and last halves of the output budget around a truncation
/// marker once the full output exceeds [`MAX_EXEC_OUTPUT_BYTES`].
fn truncate_head_tail(text: &str) -> (String, bool) {
    if text.len() <= MAX_EXEC_OUTPUT_BYTES {
        return (text.to_string(), false);
    }
    let half = MAX_EXEC_OUTPUT_BYTES / 2;
    let mut head_end = half.min(text.len());
    while head_end > 0 && !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    (
        format!(
            "{}\n[... truncated ...]\n{}",
            &text[..head_end],
            &text[tail_start..]
        ),
        true,
    )
}

fn spill_full_output(tmp_dir: &Path, full_output: &str) -> PathBuf {
    let dir = tmp_date_dir(tmp_dir).join(SPILL_SUBDIR);
    let path = dir.join(format!("{}.log", Uuid::new_v4()));
    if let Err(err) = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&path, full_output))
    {
        tracing::warn!("failed to spill exec output: {err}");
    }
    path
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, limits: SandboxLimits) {
    unsafe {
        cmd.pre_exec(move || {
            set_rlimit(libc::RLIMIT_NPROC, limits.max_processes);
            set_rlimit(libc::RLIMIT_FSIZE, limits.max_file_size_bytes);
            set_rlimit(libc::RLIMIT_CPU, limits.max_cpu_seconds);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _limits: SandboxLimits) {}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Lower the soft limit to `target`, bounded by the existing hard limit.
#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, target: u64) {
    unsafe {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(resource, &mut current) != 0 {
            return;
        }
        let soft = if current.rlim_max == libc::RLIM_INFINITY {
            target
        } else {
            target.min(current.rlim_max)
        };
        let desired = libc::rlimit {
            rlim_cur: soft,
            rlim_max: current.rlim_max,
        };
        libc::setrlimit(resource, &desired);
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut tmp = [0u8; 8192];
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        // Keep reading to EOF to avoid back-pressure, but stop retaining
        // once the cap is hit.
        if buf.len() < max_bytes {
            let take = n.min(max_bytes - buf.len());
            buf.extend_from_slice(&tmp[..take]);
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::exec_env::create_env;

    fn params(command: &str, cwd: &Path) -> ExecParams {
        ExecParams {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            timeout: DEFAULT_EXEC_TIMEOUT,
            env: create_env(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell_command(
            params("echo hello", dir.path()),
            &SandboxLimits::default(),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell_command(
            params("exit 3", dir.path()),
            &SandboxLimits::default(),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = params("sleep 5", dir.path());
        p.timeout = Duration::from_millis(100);
        let out = run_shell_command(p, &SandboxLimits::default(), dir.path())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
        assert_eq!(out.stderr, "Command timed out");
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_and_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell_command(
            params("seq 1 20000", dir.path()),
            &SandboxLimits::default(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(out.truncated);
        assert!(out.stdout.contains("[... truncated ...]"));
        assert!(out.stdout.len() < 11 * 1024);
        let spill = out.spill_path.unwrap();
        assert!(spill.is_file());
        let spilled = std::fs::read_to_string(spill).unwrap();
        assert!(spilled.lines().count() >= 20_000);
    }

    #[tokio::test]
    async fn subprocess_sees_only_the_purged_env() {
        // SAFETY: test-only env mutation.
        unsafe {
            std::env::set_var("AUTOPOIESIS_EXEC_TEST_SECRET", "sk-test");
        }
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell_command(
            params("env", dir.path()),
            &SandboxLimits::default(),
            dir.path(),
        )
        .await
        .unwrap();
        unsafe {
            std::env::remove_var("AUTOPOIESIS_EXEC_TEST_SECRET");
        }
        assert!(!out.stdout.contains("AUTOPOIESIS_EXEC_TEST_SECRET"));
    }

    #[test]
    fn head_tail_truncation_boundary() {
        let exactly = "x".repeat(MAX_EXEC_OUTPUT_BYTES);
        assert!(!truncate_head_tail(&exactly).1);
        let over = "x".repeat(MAX_EXEC_OUTPUT_BYTES + 1);
        let (text, truncated) = truncate_head_tail(&over);
        assert!(truncated);
        assert!(text.contains("[... truncated ...]"));
    }
}
