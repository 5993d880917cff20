use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::ProgressMatcher;
use crate::error::{Error, Result};

/// Exit code reported when a process is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 408;

/// Exit code reported when the OS gives none (killed by a signal).
const NO_EXIT_CODE: i32 = -1;

/// What a finished (or killed) process left behind.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

fn command<P, I, S>(program: P, args: I) -> Command
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

fn spawn(cmd: &mut Command, program: &OsStr) -> Result<Child> {
    cmd.spawn().map_err(|source| Error::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })
}

async fn kill(child: &mut Child, program: &OsStr) {
    if let Err(e) = child.kill().await {
        warn!(program = %program.to_string_lossy(), error = %e, "Failed to kill timed-out process");
    }
}

/// Run `program` with literal `args`, discarding output.
///
/// Returns the exit code, or [`TIMEOUT_EXIT_CODE`] after killing a process
/// that outlived `timeout`.
pub async fn run_with_timeout<P, S>(program: P, args: &[S], timeout: Duration) -> Result<i32>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut cmd = command(program, args);
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    let mut child = spawn(&mut cmd, program)?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status.code().unwrap_or(NO_EXIT_CODE)),
        Ok(Err(e)) => Err(Error::Spawn {
            program: program.to_string_lossy().into_owned(),
            source: e,
        }),
        Err(_) => {
            warn!(
                program = %program.to_string_lossy(),
                timeout_sec = timeout.as_secs(),
                "Process timed out; killing"
            );
            kill(&mut child, program).await;
            Ok(TIMEOUT_EXIT_CODE)
        }
    }
}

/// Run `program` capturing stdout and stderr, reporting progress as it goes.
///
/// Each stdout line is fed to `matcher`; `on_progress` fires only when the
/// whole percentage changes. On timeout the process is killed and whatever
/// output arrived so far is returned with [`TIMEOUT_EXIT_CODE`].
pub async fn run_with_progress<P, S, F>(
    program: P,
    args: &[S],
    timeout: Duration,
    matcher: &ProgressMatcher,
    mut on_progress: F,
) -> Result<ProcessOutput>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
    F: FnMut(u8),
{
    let program = program.as_ref();
    let started = Instant::now();
    let mut cmd = command(program, args);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = spawn(&mut cmd, program)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Action("stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Action("stderr was not captured".into()))?;
    let mut out_lines = BufReader::new(stdout).split(b'\n');
    let mut err_lines = BufReader::new(stderr).split(b'\n');
    let (mut out_open, mut err_open) = (true, true);

    let mut output = ProcessOutput::default();
    let mut last_percent: Option<u8> = None;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while out_open || err_open {
        tokio::select! {
            segment = out_lines.next_segment(), if out_open => match segment {
                Ok(Some(bytes)) => {
                    let line = decode_line(&bytes);
                    if let Some(percent) = matcher.parse(&line) {
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            on_progress(percent);
                        }
                    }
                    output.stdout.push_str(&line);
                    output.stdout.push('\n');
                }
                _ => out_open = false,
            },
            segment = err_lines.next_segment(), if err_open => match segment {
                Ok(Some(bytes)) => {
                    output.stderr.push_str(&decode_line(&bytes));
                    output.stderr.push('\n');
                }
                _ => err_open = false,
            },
            () = &mut deadline => {
                output.timed_out = true;
                break;
            }
        }
    }

    if !output.timed_out {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| Error::Spawn {
                    program: program.to_string_lossy().into_owned(),
                    source,
                })?;
                output.exit_code = status.code().unwrap_or(NO_EXIT_CODE);
            }
            () = &mut deadline => output.timed_out = true,
        }
    }

    if output.timed_out {
        warn!(
            program = %program.to_string_lossy(),
            timeout_sec = timeout.as_secs(),
            "Process timed out; killing"
        );
        kill(&mut child, program).await;
        output.exit_code = TIMEOUT_EXIT_CODE;
    }

    output.duration = started.elapsed();
    debug!(
        program = %program.to_string_lossy(),
        exit_code = output.exit_code,
        duration_ms = output.duration.as_millis() as u64,
        stdout_bytes = output.stdout.len(),
        "Process finished"
    );
    Ok(output)
}

/// Lossy UTF-8 with NULs (from UTF-16 console output) and the trailing CR removed.
fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    text.replace('\0', "")
}
