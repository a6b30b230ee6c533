use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Pipe, wait_timeout};
use crate::error::{EvalError, Result};

/// Lifecycle pauses for a server-under-test.
#[derive(Debug, Clone)]
pub struct ServerTiming {
    /// A server that exits this soon after spawn failed to start.
    pub crash_window: Duration,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for ServerTiming {
    fn default() -> Self {
        Self {
            crash_window: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(5),
            ready_interval: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// A compiled server submission running in its own process group.
pub struct SubmissionServer {
    child: Option<Child>,
    stderr: Pipe,
    stop_grace: Duration,
}

impl SubmissionServer {
    pub fn start(binary: &Path, port: u16, timing: &ServerTiming) -> Result<Self> {
        let mut cmd = Command::new(binary);
        cmd.env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EvalError::ServerStartup(format!("{}: {e}", binary.display())))?;
        let stderr = match child.stderr.take() {
            Some(err) => Pipe::spawn(err, "server-stderr")?,
            None => {
                let _ = child.kill();
                return Err(EvalError::ServerStartup("stderr not captured".into()));
            }
        };
        info!(pid = child.id(), port, "server started");

        thread::sleep(timing.crash_window);
        if let Some(status) = child.try_wait()? {
            let err = stderr.drain(Duration::from_millis(200));
            warn!(%status, "server exited during startup");
            return Err(EvalError::ServerStartup(err.trim().to_string()));
        }

        Ok(Self {
            child: Some(child),
            stderr,
            stop_grace: timing.stop_grace,
        })
    }

    /// Terminate the whole process group, escalating to SIGKILL after the
    /// grace period. Returns whatever the server wrote to stderr.
    pub fn stop(mut self) -> String {
        self.terminate();
        self.stderr.drain(Duration::from_millis(100))
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        signal_group(&mut child, false);
        match wait_timeout(&mut child, self.stop_grace) {
            Ok(Some(status)) => debug!(%status, "server exited"),
            _ => {
                warn!(pid = child.id(), "server ignored SIGTERM, killing");
                signal_group(&mut child, true);
                if wait_timeout(&mut child, Duration::from_secs(1))
                    .ok()
                    .flatten()
                    .is_none()
                {
                    warn!(pid = child.id(), "server still running after SIGKILL");
                }
            }
        }
    }
}

impl Drop for SubmissionServer {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn signal_group(child: &mut Child, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), sig) {
        debug!(error = %e, ?sig, "killpg failed, signalling child only");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _force: bool) {
    let _ = child.kill();
}
