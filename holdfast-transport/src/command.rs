//! Subprocess helpers shared by every backend
//!
//! Commands are built for an [`Endpoint`]: a local endpoint runs the program
//! directly, a remote one wraps it in `ssh`. Every child is spawned with
//! kill-on-drop so that dropping the owning future terminates it.

use std::process::{ExitStatus, Stdio};

use holdfast_sync::{Endpoint, Result, Side, SyncError};
use tokio::process::Command;
use tracing::debug;

/// Output kept from a failing command, split between head and tail
pub const MAX_CAPTURED_OUTPUT: usize = 128 * 1024;

/// Exit status `ssh` itself uses for connection failures
pub const SSH_CONNECT_FAILURE: i32 = 255;

/// How remote endpoints are reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    program: String,
    options: Vec<String>,
}

impl Default for RemoteShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=30".to_string(),
            ],
        }
    }
}

impl RemoteShell {
    pub fn new(program: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    /// `program args..` on the endpoint's host, or locally without a host
    pub fn command(&self, endpoint: &Endpoint, program: &str, args: &[String]) -> Command {
        let mut command = match &endpoint.host {
            Some(host) => {
                let mut command = Command::new(&self.program);
                command.args(&self.options).arg(host).arg("--");
                let remote: Vec<String> = std::iter::once(program.to_string())
                    .chain(args.iter().cloned())
                    .map(|arg| shell_quote(&arg))
                    .collect();
                command.arg(remote.join(" "));
                command
            }
            None => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        };
        command.kill_on_drop(true).stdin(Stdio::null());
        command
    }
}

/// Quote `arg` for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// First meaningful stderr line, falling back to the exit status
    pub fn summary(&self) -> String {
        stderr_summary(&self.stderr).unwrap_or_else(|| self.status.to_string())
    }
}

/// Run `command` to completion, capturing both streams
pub async fn run(mut command: Command, side: Side, what: &str) -> Result<CommandOutput> {
    debug!("Running {}: {:?}", what, command.as_std());
    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SyncError::unreachable(side, format!("cannot start {}: {}", what, e)))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: trim_output(&output.stdout),
        stderr: trim_output(&output.stderr),
    })
}

/// Run `command` and fail as unreachable on a non-zero exit
pub async fn run_checked(command: Command, side: Side, what: &str) -> Result<CommandOutput> {
    let output = run(command, side, what).await?;
    if !output.success() {
        return Err(SyncError::unreachable(
            side,
            format!("{} failed: {}", what, output.summary()),
        ));
    }
    Ok(output)
}

/// First stderr line that says something
///
/// Blank lines, warnings and the `ssh` banner noise are skipped.
pub fn stderr_summary(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            !lower.starts_with("warning:") && !lower.starts_with("pseudo-terminal")
        })
        .map(str::to_string)
}

/// Lossy UTF-8 of `bytes`, keeping the head and tail beyond
/// [`MAX_CAPTURED_OUTPUT`]
pub fn trim_output(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_CAPTURED_OUTPUT {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let half = MAX_CAPTURED_OUTPUT / 2;
    let elided = bytes.len() - 2 * half;
    format!(
        "{}\n... [{} bytes elided] ...\n{}",
        String::from_utf8_lossy(&bytes[..half]),
        elided,
        String::from_utf8_lossy(&bytes[bytes.len() - half..])
    )
}

/// Whether a failed command never reached the remote side
pub fn is_connect_failure(endpoint: &Endpoint, status: &ExitStatus) -> bool {
    endpoint.host.is_some() && status.code() == Some(SSH_CONNECT_FAILURE)
}

/// Whether the process died writing to a closed pipe
///
/// A shell wrapper reports the signal as exit status 128 + SIGPIPE.
pub fn is_broken_pipe(status: &ExitStatus) -> bool {
    const SIGPIPE: i32 = 13;
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(SIGPIPE) {
            return true;
        }
    }
    status.code() == Some(128 + SIGPIPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("tank/db@holdfast-20240101T0000Z"), "tank/db@holdfast-20240101T0000Z");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_stderr_summary_skips_noise() {
        let stderr = "\nWarning: Permanently added 'db1' to the list of known hosts.\n\
                      cannot open 'rpool/missing': dataset does not exist\nusage: ...\n";
        assert_eq!(
            stderr_summary(stderr).as_deref(),
            Some("cannot open 'rpool/missing': dataset does not exist")
        );
        assert_eq!(stderr_summary("  \n\n"), None);
    }

    #[test]
    fn test_trim_output_keeps_head_and_tail() {
        let mut bytes = vec![b'a'; MAX_CAPTURED_OUTPUT];
        bytes.extend(vec![b'b'; 1000]);
        let trimmed = trim_output(&bytes);
        assert!(trimmed.starts_with('a'));
        assert!(trimmed.ends_with('b'));
        assert!(trimmed.contains("[1000 bytes elided]"));

        assert_eq!(trim_output(b"short"), "short");
    }

    #[test]
    fn test_remote_command_goes_through_ssh() {
        let shell = RemoteShell::default();
        let remote = Endpoint::remote("db1", "rpool/db");
        let command = shell.command(&remote, "zfs", &["list".to_string(), "rpool/my db".to_string()]);
        let inner = command.as_std();
        assert_eq!(inner.get_program(), "ssh");
        let args: Vec<String> = inner.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args.last().map(String::as_str), Some("zfs list 'rpool/my db'"));
        assert!(args.contains(&"db1".to_string()));

        let local = shell.command(&Endpoint::local("tank/db"), "zfs", &["list".to_string()]);
        assert_eq!(local.as_std().get_program(), "zfs");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo 'cannot receive: out of space' >&2; exit 1"]);
        let err = run_checked(command, Side::Local, "receive").await.unwrap_err();
        assert!(err.to_string().contains("out of space"));
    }
}
