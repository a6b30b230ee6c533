//! Running compiled submissions as subprocesses.
//!
//! Child output is pumped by one reader thread per pipe into a channel,
//! so every read on our side can be bounded by a timeout.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::case::TestCase;
use crate::error::{EvalError, Result};
use crate::peer::PeerState;
use crate::port::{Endpoint, LOCALHOST};
use crate::validate::{Expected, MatchType, validate};

pub mod server;

const WAIT_POLL: Duration = Duration::from_millis(20);
/// Upper bound for collecting output of an already exited child.
const EXIT_DRAIN: Duration = Duration::from_secs(1);
const RESULT_MARKER: &str = "Result from server:";

/// Pauses used when feeding an interactive client line by line.
#[derive(Debug, Clone)]
pub struct InteractiveTiming {
    /// Pause after each write before reading.
    pub settle: Duration,
    /// Read window after each write.
    pub read: Duration,
    /// Read window after the last input.
    pub final_read: Duration,
    /// How long the client may take to exit once stdin is closed.
    pub exit_wait: Duration,
    pub stderr_read: Duration,
}

impl Default for InteractiveTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            read: Duration::from_millis(500),
            final_read: Duration::from_secs(1),
            exit_wait: Duration::from_secs(2),
            stderr_read: Duration::from_millis(200),
        }
    }
}

/// Output of a child pipe, readable with timeouts.
pub struct Pipe {
    rx: Receiver<Vec<u8>>,
}

impl Pipe {
    pub fn spawn<R: Read + Send + 'static>(mut src: R, name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("pipe-{name}"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match src.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })?;
        Ok(Self { rx })
    }

    /// Everything that arrives within `window`, or until the pipe closes.
    pub fn drain(&self, window: Duration) -> String {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Poll `child` until it exits or `timeout` passes.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed, child probably gone");
    }
    let _ = child.wait();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOutcome {
    pub passed: bool,
    pub output: String,
}

struct Captured {
    stdout: String,
    stderr: String,
}

/// Run one client-under-test instance against the peer at `endpoint`.
///
/// Stderr output and timeouts are recorded into `state` so they count
/// against the run even when stdout looks right.
pub fn run_client(
    binary: &Path,
    case: &TestCase,
    endpoint: Endpoint,
    timing: &InteractiveTiming,
    state: &PeerState,
) -> ClientOutcome {
    let inputs = case.input.as_ref().map(|l| l.to_vec());
    info!(interactive = case.interactive, ?inputs, "starting client");

    let captured = match &inputs {
        Some(lines) if case.interactive => run_interactive(binary, endpoint, lines, timing),
        _ => run_batch(binary, endpoint, inputs.as_deref(), case.timeout()),
    };
    let captured = match captured {
        Ok(c) => c,
        Err(EvalError::Timeout(what)) => {
            let msg = format!("Timeout during {what}");
            state.record_error(msg.clone());
            return ClientOutcome {
                passed: false,
                output: msg,
            };
        }
        Err(e) => {
            state.record_error(format!("Error: {e}"));
            return ClientOutcome {
                passed: false,
                output: format!("Error during client execution: {e}"),
            };
        }
    };

    let output = captured.stdout.trim().to_string();
    debug!(%output, "client output");
    let errors = captured.stderr.trim();
    if !errors.is_empty() {
        warn!(stderr = %errors, "client wrote to stderr");
        state.record_error(errors.to_string());
    }
    judge_output(case, output)
}

fn spawn_client(binary: &Path, endpoint: Endpoint) -> io::Result<Child> {
    Command::new(binary)
        .env("SERVER_PORT", endpoint.port.to_string())
        .env("SERVER_HOST", LOCALHOST)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn take_pipes(child: &mut Child) -> io::Result<(ChildStdin, Pipe, Pipe)> {
    let missing = || io::Error::other("child pipe not captured");
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = Pipe::spawn(child.stdout.take().ok_or_else(missing)?, "stdout")?;
    let stderr = Pipe::spawn(child.stderr.take().ok_or_else(missing)?, "stderr")?;
    Ok((stdin, stdout, stderr))
}

fn run_interactive(
    binary: &Path,
    endpoint: Endpoint,
    inputs: &[String],
    timing: &InteractiveTiming,
) -> Result<Captured> {
    let mut child = spawn_client(binary, endpoint)?;
    let (mut stdin, stdout, stderr) = match take_pipes(&mut child) {
        Ok(p) => p,
        Err(e) => {
            kill(&mut child);
            return Err(e.into());
        }
    };

    let mut all = String::new();
    thread::sleep(timing.settle);
    let prompt = stdout.drain(timing.read);
    debug!(prompt = %prompt.trim(), "initial output");
    all.push_str(&prompt);

    for line in inputs {
        debug!(%line, "sending input");
        if let Err(e) = stdin
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|()| stdin.flush())
        {
            kill(&mut child);
            return Err(e.into());
        }
        thread::sleep(timing.settle);
        let response = stdout.drain(timing.read);
        debug!(response = %response.trim(), "response after input");
        all.push_str(&response);
    }

    thread::sleep(timing.settle);
    all.push_str(&stdout.drain(timing.final_read));

    drop(stdin);
    if wait_timeout(&mut child, timing.exit_wait)?.is_none() {
        kill(&mut child);
        return Err(EvalError::Timeout("execution"));
    }
    Ok(Captured {
        stdout: all,
        stderr: stderr.drain(timing.stderr_read),
    })
}

fn run_batch(
    binary: &Path,
    endpoint: Endpoint,
    inputs: Option<&[String]>,
    timeout: Duration,
) -> Result<Captured> {
    let mut child = spawn_client(binary, endpoint)?;
    let (stdin, stdout, stderr) = match take_pipes(&mut child) {
        Ok(p) => p,
        Err(e) => {
            kill(&mut child);
            return Err(e.into());
        }
    };

    let text = inputs.map(|lines| {
        let mut text = lines.join("\n");
        text.push('\n');
        debug!(input = %text.trim(), "running client with input");
        text
    });
    if let Err(e) = feed(stdin, text) {
        kill(&mut child);
        return Err(e.into());
    }

    if wait_timeout(&mut child, timeout)?.is_none() {
        kill(&mut child);
        return Err(EvalError::Timeout("execution"));
    }
    Ok(Captured {
        stdout: stdout.drain(EXIT_DRAIN),
        stderr: stderr.drain(EXIT_DRAIN),
    })
}

/// Write `text` to the child's stdin on a helper thread, then close it.
///
/// A child that never reads cannot stall the caller past its timeout: the
/// writer unblocks with a broken pipe once the child is killed.
fn feed(mut stdin: ChildStdin, text: Option<String>) -> io::Result<()> {
    thread::Builder::new()
        .name("pipe-stdin".into())
        .spawn(move || {
            if let Some(text) = text
                && let Err(e) = stdin.write_all(text.as_bytes())
            {
                debug!(error = %e, "client closed stdin early");
            }
        })
        .map(drop)
}

/// Judge a client's trimmed stdout.
///
/// An `expectedFormula` found on a `Result from server:` line or anywhere
/// in the output is enough on its own. Otherwise the case's expected
/// output and match type decide.
pub fn judge_output(case: &TestCase, output: String) -> ClientOutcome {
    if let Some(formula) = &case.expected_formula {
        let on_result_line = output
            .lines()
            .find(|l| l.contains(RESULT_MARKER))
            .and_then(|l| l.split_once(':'))
            .is_some_and(|(_, value)| value.trim().contains(formula.as_str()));
        if on_result_line || output.contains(formula.as_str()) {
            debug!(%formula, "expected formula found");
            return ClientOutcome {
                passed: true,
                output,
            };
        }
    }

    let match_type = case.match_type();
    if match_type == MatchType::Contains
        && let Expected::Text(expected) = &case.expected_output
        && !expected.is_empty()
    {
        return if output.contains(expected.as_str()) {
            ClientOutcome {
                passed: true,
                output,
            }
        } else {
            ClientOutcome {
                passed: false,
                output: format!(
                    "Output validation failed: '{expected}' not found in output. Full output: {output}"
                ),
            }
        };
    }

    let v = validate(&output, &case.expected_output, match_type);
    if v.passed {
        ClientOutcome {
            passed: true,
            output,
        }
    } else {
        ClientOutcome {
            passed: false,
            output: format!("Output validation failed: {}", v.diagnostic),
        }
    }
}
