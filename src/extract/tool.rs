//! Locating and running the external programs behind each extraction strategy.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::config::Config;
use crate::error::{ImageError, Result};

/// Phrases mount, sudo and the unpackers print when they lack privileges.
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "must be superuser",
    "only root can",
    "a password is required",
    "not in the sudoers",
];

pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last non-empty line of stderr, falling back to stdout, for error messages.
    pub fn summary(&self) -> String {
        [&self.stderr, &self.stdout]
            .iter()
            .find_map(|text| text.lines().rev().map(str::trim).find(|l| !l.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| format!("exited with {}", self.status))
    }

    pub fn mentions_permission_problem(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        PERMISSION_MARKERS.iter().any(|m| stderr.contains(m))
    }
}

pub enum RunOutcome {
    Finished(ToolOutput),
    TimedOut(Duration),
}

/// Resolves tool names to executables, honoring configured overrides.
#[derive(Debug, Clone)]
pub struct ToolBox {
    overrides: HashMap<String, PathBuf>,
    privilege_helper: Option<String>,
    timeout: Option<Duration>,
}

impl ToolBox {
    pub fn new(config: &Config) -> Self {
        Self {
            overrides: config.tool_paths.clone(),
            privilege_helper: config.privilege_helper.clone(),
            timeout: config.tool_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.overrides.get(name) {
            if path.is_file() {
                return Ok(path.clone());
            }
            tracing::warn!("Configured path for {} does not exist: {}", name, path.display());
            return Err(ImageError::ToolUnavailable(name.to_string()));
        }
        which::which(name).map_err(|_| ImageError::ToolUnavailable(name.to_string()))
    }

    /// Command for an unprivileged tool.
    pub fn command(&self, name: &str) -> Result<Command> {
        Ok(Command::new(self.locate(name)?))
    }

    /// Command for a tool that needs privileges, prefixed by the configured helper.
    ///
    /// Without a helper the tool runs as the current user and a permission
    /// failure is reported as such.
    pub fn privileged_command(&self, name: &str) -> Result<Command> {
        let tool = self.locate(name)?;
        match &self.privilege_helper {
            Some(helper) => {
                let helper = which::which(helper)
                    .map_err(|_| ImageError::ToolUnavailable(helper.clone()))?;
                let mut cmd = Command::new(helper);
                cmd.arg(tool);
                Ok(cmd)
            }
            None => Ok(Command::new(tool)),
        }
    }

    pub fn uses_privilege_helper(&self) -> bool {
        self.privilege_helper.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Runs `cmd` to completion, killing it once `timeout` elapses.
///
/// Stdin is inherited when `interactive` is set so a privilege helper can
/// prompt for a password on the terminal. Callable from plain threads, the
/// blocking pool and async code alike.
pub fn run(cmd: Command, timeout: Option<Duration>, interactive: bool) -> Result<RunOutcome> {
    let task = run_async(cmd, timeout, interactive);
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(task))
        }
        // A current-thread runtime cannot be re-entered; drive the tool on its own thread
        Ok(_) => thread::scope(|scope| {
            scope
                .spawn(move || block_on_local(task))
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        }),
        Err(_) => block_on_local(task),
    }
}

pub async fn run_async(
    mut cmd: Command,
    timeout: Option<Duration>,
    interactive: bool,
) -> Result<RunOutcome> {
    tracing::debug!("Running {:?}", cmd.as_std());
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(if interactive { Stdio::inherit() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!("{} exceeded {:?}, killed", program, limit);
                return Ok(RunOutcome::TimedOut(limit));
            }
        },
        None => cmd.output().await?,
    };

    let output = ToolOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!("{} finished with {}", program, output.status);
    Ok(RunOutcome::Finished(output))
}

fn block_on_local(task: impl Future<Output = Result<RunOutcome>>) -> Result<RunOutcome> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(task)
}

/// Whether `path` is listed as a mount point in the host mount table.
///
/// Returns `None` when the table cannot be read (non-Linux hosts).
pub fn is_mount_point(path: &Path) -> Option<bool> {
    let table = std::fs::read_to_string("/proc/self/mounts").ok()?;
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Some(table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|field| Path::new(&unescape_mount_field(field)) == target)
            .unwrap_or(false)
    }))
}

/// Mount tables escape whitespace as octal sequences (`\040` for space).
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(digits) = bytes.get(i + 1..i + 4) {
                if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                    let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                    out.push(code as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/mnt/fw\\040image"), "/mnt/fw image");
        assert_eq!(unescape_mount_field("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_missing_override_is_unavailable() {
        let mut config = Config::default();
        config
            .tool_paths
            .insert("jefferson".to_string(), PathBuf::from("/nonexistent/jefferson"));
        let tools = ToolBox::new(&config);
        assert!(matches!(
            tools.locate("jefferson"),
            Err(ImageError::ToolUnavailable(name)) if name == "jefferson"
        ));
    }

    #[test]
    fn test_run_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo 'mount: only root can do that' >&2; exit 3"]);
        let outcome = run(cmd, Some(Duration::from_secs(10)), false).unwrap();
        let RunOutcome::Finished(output) = outcome else {
            panic!("sh should not time out");
        };
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert!(output.mentions_permission_problem());
        assert_eq!(output.summary(), "mount: only root can do that");
    }

    #[test]
    fn test_run_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let outcome = run(cmd, Some(Duration::from_millis(100)), false).unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_run_inside_current_thread_runtime() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo unpacked"]);
        let RunOutcome::Finished(output) = run(cmd, Some(Duration::from_secs(10)), false).unwrap()
        else {
            panic!("echo should not time out");
        };
        assert_eq!(output.stdout.trim(), "unpacked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_inside_multi_thread_runtime() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let outcome = run(cmd, Some(Duration::from_millis(100)), false).unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_run_async_reports_missing_program() {
        let cmd = Command::new("/nonexistent/unsquashfs");
        assert!(run_async(cmd, None, false).await.is_err());
    }
}
