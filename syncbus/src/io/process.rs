//! Child processes with a timeout and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last line of stderr, for one-line error reports.
    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

/// Build a [`Command`] from an argv vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must not be empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Start the child in a process group of its own.
///
/// A terminal Ctrl-C then reaches only this process, and a timeout can kill
/// everything the child forked.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// How long output readers get to finish once a timed-out child is killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

type Captured = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout, capturing stdout/stderr without risking
/// pipe deadlocks.
///
/// The child runs in its own process group. Output is read concurrently
/// while it runs. `output_limit_bytes` bounds what is kept in memory; the
/// rest is drained and counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    // Feed stdin from a detached thread so a child that never reads it
    // cannot block us past the timeout.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            // A child that exits early closes the pipe; that is not our error.
            let _ = child_stdin.write_all(&input);
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out");
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let grace = timed_out.then_some(KILL_GRACE);
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, grace).context("read stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, grace).context("read stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// SIGKILL the child's whole process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = i32::try_from(child.id()).context("child pid out of range")?;
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(err) => warn!(err = %err, "killpg failed, killing the child only"),
        }
    }
    child.kill().context("kill command")
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Wait for a reader. With a `grace` bound, a pipe still held open by a
/// stray process is abandoned rather than waited on.
fn collect_output(rx: &Receiver<Captured>, grace: Option<Duration>) -> Captured {
    let Some(grace) = grace else {
        return rx
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))?;
    };
    match rx.recv_timeout(grace) {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still open after kill, abandoning it");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
