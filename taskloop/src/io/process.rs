//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported when a child is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Child process result; `stdout` is whatever the consumer produced.
#[derive(Debug)]
pub struct ProcessOutput<T> {
    pub status: ExitStatus,
    pub stdout: T,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl<T> ProcessOutput<T> {
    /// Exit code as surfaced to callers: the child's own code, 124 on timeout.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        // Killed by a signal: no code, report generic failure.
        self.status.code().unwrap_or(1)
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Where raw stdout bytes are copied while the consumer reads them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeeOptions<'a> {
    /// File receiving every stdout byte, flushed per read.
    pub stream_path: Option<&'a Path>,
    /// Mirror raw stdout to our stderr.
    pub mirror_stderr: bool,
}

/// Run a command with a timeout, handing stdout to `consume` on a reader thread.
///
/// stderr is drained concurrently (bounded by `output_limit_bytes`) so the child
/// never blocks on a full pipe. Whatever `consume` leaves unread is drained
/// before the thread exits. The consumer's return value comes back in
/// [`ProcessOutput::stdout`].
///
/// stdin is written from its own thread, so a child that never reads it cannot
/// stall the timeout. On Unix the child leads a fresh process group; a timeout
/// kills the group, as does a child that exits while descendants still hold its
/// pipes past a short grace period.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = tee.stream_path.is_some()))]
pub fn run_command_consuming<T, F>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: TeeOptions<'_>,
    consume: F,
) -> Result<ProcessOutput<T>>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn BufRead) -> T + Send + 'static,
{
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut sinks: Vec<Box<dyn Write + Send>> = Vec::new();
    if let Some(path) = tee.stream_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create stream dir {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
        sinks.push(Box::new(BufWriter::new(file)));
    }
    if tee.mirror_stderr {
        sinks.push(Box::new(io::stderr()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a timeout reaches the harness's tool subprocesses too.
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
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

    let stdout_rx = spawn_worker(move || {
        let mut reader = BufReader::new(TeeReader {
            inner: stdout,
            sinks,
        });
        let value = consume(&mut reader);
        // Keep the pipe flowing if the consumer stopped early.
        let _ = io::copy(&mut reader, &mut io::sink());
        value
    });
    let stderr_rx = spawn_worker(move || read_stream_limited(stderr, output_limit_bytes));
    let stdin_rx = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(spawn_worker(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    // The child may exit without reading its input; its status tells the story.
                    warn!(err = %e, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Descendants that outlive the child keep the pipes open; give them a
    // moment, then take the whole group down.
    let mut stdout = await_worker(&stdout_rx, "stdout reader")?;
    let mut stderr = await_worker(&stderr_rx, "stderr reader")?;
    let mut stdin_done = match &stdin_rx {
        Some(rx) => await_worker(rx, "stdin writer")?.is_some(),
        None => true,
    };
    if stdout.is_none() || stderr.is_none() || !stdin_done {
        warn!("descendant processes still hold the child's pipes, killing process group");
        if let Err(e) = kill_process_group(&mut child) {
            debug!(err = %e, "process group kill after exit failed");
        }
        if stdout.is_none() {
            stdout = await_worker(&stdout_rx, "stdout reader")?;
        }
        if stderr.is_none() {
            stderr = await_worker(&stderr_rx, "stderr reader")?;
        }
        if !stdin_done
            && let Some(rx) = &stdin_rx
        {
            stdin_done = await_worker(rx, "stdin writer")?.is_some();
        }
    }
    if !stdin_done {
        warn!("stdin writer still blocked, abandoning it");
    }

    let stdout =
        stdout.ok_or_else(|| anyhow!("stdout still open after killing the process group"))?;
    let (stderr, stderr_truncated) = match stderr {
        Some(result) => result.context("read stderr")?,
        None => {
            warn!("stderr still open after killing the process group, dropping it");
            (Vec::new(), 0)
        }
    };

    if stderr_truncated > 0 {
        warn!(stderr_truncated, "stderr truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stderr_truncated,
        timed_out,
    })
}

/// How long a pipe worker may run on once the child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

fn spawn_worker<T, F>(work: F) -> Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(work());
    });
    rx
}

/// `Ok(None)` when the worker is still running after [`DRAIN_GRACE`].
fn await_worker<T>(rx: &Receiver<T>, name: &str) -> Result<Option<T>> {
    match rx.recv_timeout(DRAIN_GRACE) {
        Ok(value) => Ok(Some(value)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{name} thread panicked")),
    }
}

/// SIGKILL the child's whole process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(child.id()) {
            match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => return Ok(()),
                Err(e) => warn!(err = %e, "killpg failed, killing child only"),
            }
        }
    }
    child.kill()
}

/// Consumer that keeps at most `limit` bytes of stdout, echoing lines when asked.
///
/// Returns the kept bytes and the number of bytes discarded.
pub fn capture_lines(
    reader: &mut dyn BufRead,
    limit: usize,
    echo: bool,
) -> io::Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut out = io::stdout();

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if echo && (out.write_all(&line).is_err() || out.flush().is_err()) {
            debug!("stdout echo failed");
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

struct TeeReader<R> {
    inner: R,
    sinks: Vec<Box<dyn Write + Send>>,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sinks.retain_mut(|sink| {
                match sink.write_all(&buf[..n]).and_then(|()| sink.flush()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(err = %e, "failed to tee child output, dropping sink");
                        false
                    }
                }
            });
        }
        Ok(n)
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
