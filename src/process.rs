//! Subprocess execution layer.
//!
//! External collaborators (feature extractors, the trainer, the decoder, the
//! scorer) are opaque commands with file contracts. This module runs them
//! with captured or log-file-redirected output, converts nonzero exits into
//! typed errors, and kills children when the pipeline is cancelled.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::error::{PrepError, PrepResult};

/// Poll interval for child exit / cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lightweight, `Send + Sync + Clone` handle that long-running subprocess
/// loops use to observe pipeline cancellation (Ctrl+C or deadline).
#[derive(Debug, Clone, Copy)]
pub struct CancelToken {
    deadline: Option<chrono::DateTime<Utc>>,
}

impl CancelToken {
    /// A token that only reacts to Ctrl+C, never to a deadline.
    #[must_use]
    pub fn no_deadline() -> Self {
        Self { deadline: None }
    }

    /// A token with a deadline relative to now.
    #[must_use]
    pub fn with_deadline_from_now(duration: Duration) -> Self {
        Self {
            deadline: Some(Utc::now() + chrono::Duration::milliseconds(duration.as_millis() as i64)),
        }
    }

    /// Returns an error once the pipeline should stop: either a shutdown
    /// signal was received or the deadline has passed.
    pub fn checkpoint(&self) -> PrepResult<()> {
        if crate::cli::ShutdownController::is_shutting_down() {
            return Err(PrepError::Cancelled(
                "pipeline cancelled via Ctrl+C".to_owned(),
            ));
        }
        if let Some(deadline) = self.deadline
            && Utc::now() >= deadline
        {
            return Err(PrepError::Cancelled("pipeline deadline exceeded".to_owned()));
        }
        Ok(())
    }

    /// Convenience wrapper around `checkpoint()` for boolean guards.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }

    /// A token whose deadline is already in the past.
    #[cfg(test)]
    pub(crate) fn already_expired() -> Self {
        Self {
            deadline: Some(chrono::DateTime::<Utc>::MIN_UTC),
        }
    }
}

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Run a subprocess to completion with captured stdout/stderr.
///
/// Nonzero exit becomes [`PrepError::CommandFailed`] carrying trimmed stderr.
pub fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> PrepResult<Output> {
    if !command_exists(program) {
        return Err(PrepError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = render_command(program, args);
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output()?;
    validate_command_output(&rendered, output)
}

/// Run a subprocess with cancellation-aware polling.
///
/// Polls `token.checkpoint()` on every iteration. If the checkpoint fails,
/// the child process is killed and reaped before the error is propagated, so
/// no orphan survives the pipeline's death.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    token: &CancelToken,
) -> PrepResult<Output> {
    if !command_exists(program) {
        return Err(PrepError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = render_command(program, args);
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let (stdout_tx, stdout_rx) = std::sync::mpsc::channel();
    let (stderr_tx, stderr_rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        let _ = stdout_tx.send(buf);
    });

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            return validate_command_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if let Err(err) = token.checkpoint() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Run a subprocess with stdout and stderr appended to `log_path`.
///
/// This is the execution primitive for dispatcher jobs: each job owns its log
/// destination, so concurrent jobs never interleave output. Cancellation
/// kills and reaps the child like [`run_command_cancellable`]. On failure the
/// returned error names the command and points at the log tail.
pub fn run_logged_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    log_path: &Path,
    token: &CancelToken,
) -> PrepResult<()> {
    if !command_exists(program) {
        return Err(PrepError::CommandMissing {
            command: program.to_owned(),
        });
    }

    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let log_for_stderr = log_file.try_clone()?;

    let rendered = render_command(program, args);
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::from(log_file));
    command.stderr(Stdio::from(log_for_stderr));
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;

    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            let code = status.code().unwrap_or(-1);
            let tail = read_log_tail(log_path);
            return Err(PrepError::from_command_failure(rendered, code, tail));
        }

        if let Err(err) = token.checkpoint() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Last few lines of a job log, used to enrich failure errors.
fn read_log_tail(log_path: &Path) -> String {
    const TAIL_LINES: usize = 5;
    match std::fs::read_to_string(log_path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(TAIL_LINES);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}

fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_owned()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

fn validate_command_output(rendered: &str, output: Output) -> PrepResult<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(PrepError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}
