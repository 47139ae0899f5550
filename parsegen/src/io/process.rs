//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Interval between cancellation checks while waiting on a child.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output pipes may stay open after the child has ended.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Render both streams for a log file.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str(&format!("=== {label} exit: {:?} ===\n", self.status.code()));
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_lossy());
        buf.push_str(&self.stdout_truncated_notice(label));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_lossy());
        buf.push_str(&self.stderr_truncated_notice(label));
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Substitute `{name}` placeholders in an argv template and build a command.
pub fn command_from_template(template: &[String], vars: &[(&str, String)]) -> Result<Command> {
    let (program, args) = template
        .split_first()
        .ok_or_else(|| anyhow!("command template must be non-empty"))?;
    let expand = |arg: &String| {
        vars.iter().fold(arg.clone(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
    };
    let mut cmd = Command::new(expand(program));
    cmd.args(args.iter().map(expand));
    Ok(cmd)
}

/// Whether an argv template references `{name}`.
pub fn template_uses(template: &[String], name: &str) -> bool {
    let needle = format!("{{{name}}}");
    template.iter().any(|arg| arg.contains(&needle))
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs and stdin is fed from its own thread, so
/// neither a chatty nor a non-reading child can stall the deadline. `output_limit_bytes` bounds
/// the amount of stdout/stderr stored in memory (bytes beyond this are discarded while still
/// draining the pipe). When `cancel` fires, the child is killed and the output is marked
/// `cancelled`.
///
/// On unix the child leads its own process group. The whole group is killed once the child
/// exits, times out or is cancelled, so nothing it spawned outlives the call.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

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

    let stdout_capture = StreamCapture::spawn(stdout, output_limit_bytes);
    let stderr_capture = StreamCapture::spawn(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Detached: the write ends when the child reads everything or the pipe closes.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                // A child that exits without reading its input is judged by its status.
                debug!(err = %e, "failed to write child stdin");
            }
        });
    }

    let (status, timed_out, cancelled) = match wait_until(&mut child, timeout, cancel)? {
        WaitEnd::Exited(status) => {
            kill_group(&child);
            (status, false, false)
        }
        WaitEnd::TimedOut => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            (kill_and_reap(&mut child)?, true, false)
        }
        WaitEnd::Cancelled => {
            warn!("command cancelled, killing");
            (kill_and_reap(&mut child)?, false, true)
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) = stdout_capture.finish(drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) = stderr_capture.finish(drain_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

enum WaitEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_until(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<WaitEnd> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WaitEnd::TimedOut);
        }
        let slice = match cancel {
            Some(_) => remaining.min(CANCEL_POLL_INTERVAL),
            None => remaining,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(WaitEnd::Exited(status));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Ok(WaitEnd::Cancelled);
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    if let Err(e) = child.kill() {
        // Already exited; the wait below still reaps it.
        debug!(err = %e, "kill command");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL every process in the child's group.
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(err = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Bytes captured so far and bytes discarded past the limit.
type Captured = (Vec<u8>, usize);

/// A pipe drained on a background thread into a shared buffer.
struct StreamCapture {
    captured: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamCapture {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new((Vec::new(), 0)));
        let sink = Arc::clone(&captured);
        let handle = thread::spawn(move || read_stream_limited(reader, limit, &sink));
        Self { captured, handle }
    }

    /// Wait for the pipe to close until `deadline`, then take what was captured.
    ///
    /// A descendant that escaped the process group can hold the pipe open; the reader
    /// thread is then left behind and the output seen so far is returned.
    fn finish(self, deadline: Instant) -> Result<Captured> {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        if self.handle.is_finished() {
            match self.handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("output reader thread panicked")),
            }
        } else {
            warn!("output pipe still open after the child ended, abandoning reader");
        }
        let mut captured = self
            .captured
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        Ok(std::mem::take(&mut *captured))
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &Mutex<Captured>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
        let (buf, truncated) = &mut *captured;
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            *truncated += n.saturating_sub(keep);
        } else {
            *truncated += n;
        }
    }

    Ok(())
}
