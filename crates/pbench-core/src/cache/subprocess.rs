//! Bounded subprocess execution for archive extraction.

use crate::config::CacheConfig;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Captured output of a successful command.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Why a command failed.
#[derive(Debug)]
pub(crate) enum CommandFailure {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Timeout { after: Duration, stderr: String },
    Exit { status: ExitStatus, stderr: String },
}

impl CommandFailure {
    /// One-line description naming the program.
    pub fn message(&self, program: &str) -> String {
        match self {
            CommandFailure::Spawn(e) => format!("unable to run {program}: {e}"),
            CommandFailure::Wait(e) => format!("lost track of {program}: {e}"),
            CommandFailure::Timeout { after, .. } => {
                format!("{program} timed out after {:.0}s", after.as_secs_f64())
            }
            CommandFailure::Exit { status, .. } => match status.code() {
                Some(code) => format!("{program} exited with status {code}"),
                None => format!("{program} was terminated by a signal"),
            },
        }
    }

    /// Captured stderr, already truncated.
    pub fn stderr(&self) -> Option<String> {
        match self {
            CommandFailure::Timeout { stderr, .. } | CommandFailure::Exit { stderr, .. }
                if !stderr.is_empty() =>
            {
                Some(stderr.clone())
            }
            _ => None,
        }
    }
}

/// Cap subprocess stderr for inclusion in an error.
pub(crate) fn truncate_stderr(message: &str) -> String {
    if message.len() <= CacheConfig::MAX_ERROR - CacheConfig::TRUNC_PREFIX.len() {
        return message.to_string();
    }
    let mut text = format!("{}{}", CacheConfig::TRUNC_PREFIX, message);
    let mut end = CacheConfig::MAX_ERROR;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buffer) {
            debug!("Subprocess pipe read failed: {}", e);
        }
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Run a command in `cwd` with no stdin, capturing output, and kill it if it
/// runs longer than `timeout`.
pub(crate) fn run_command<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    cwd: &Path,
    timeout: Duration,
) -> std::result::Result<CommandOutput, CommandFailure> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(CommandFailure::Spawn)?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let mut delay = CacheConfig::PROCESS_POLL_INITIAL;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(e) => break Err(CommandFailure::Wait(e)),
        }
        if start.elapsed() >= timeout {
            warn!("{} exceeded {:?}; killing it", program, timeout);
            if let Err(e) = child.kill() {
                debug!("Failed to kill {}: {}", program, e);
            }
            let _ = child.wait();
            let stderr = truncate_stderr(&String::from_utf8_lossy(&collect(stderr)));
            collect(stdout);
            return Err(CommandFailure::Timeout {
                after: timeout,
                stderr,
            });
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(CacheConfig::PROCESS_POLL_MAX);
    };

    let stdout = collect(stdout);
    let stderr = truncate_stderr(&String::from_utf8_lossy(&collect(stderr)));
    let status = status?;
    if !status.success() {
        return Err(CommandFailure::Exit { status, stderr });
    }
    Ok(CommandOutput { stdout, stderr })
}
