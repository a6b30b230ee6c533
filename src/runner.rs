//! One evaluation run, from source file to `RESULT:` line.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{info, warn};

use crate::case::Scenario;
use crate::compile::{Compiler, patch_port};
use crate::driver;
use crate::error::{EvalError, Result};
use crate::peer;
use crate::port::{self, Endpoint};
use crate::process::server::{ServerTiming, SubmissionServer};
use crate::process::{ClientOutcome, InteractiveTiming, run_client};

/// First port tried for a server-under-test.
pub const SERVER_PORT_BASE: u16 = 10_000;
pub const SERVER_PORT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: Status,
    pub message: String,
}

impl Verdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            status: Status::Pass,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            message: message.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

impl From<EvalError> for Verdict {
    fn from(e: EvalError) -> Self {
        Verdict::fail(e.to_string())
    }
}

/// `RESULT:<PASS|FAIL>:<message>`
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RESULT:{}:{}", self.status, self.message)
    }
}

pub struct Runner<C> {
    pub compiler: C,
    /// Parent of the per-run scratch directory; system temp dir if unset.
    pub work_dir: Option<PathBuf>,
    pub interactive: InteractiveTiming,
    pub server: ServerTiming,
}

impl<C: Compiler> Runner<C> {
    pub fn new(compiler: C) -> Self {
        Self {
            compiler,
            work_dir: None,
            interactive: InteractiveTiming::default(),
            server: ServerTiming::default(),
        }
    }

    /// Evaluate a client submission against a scripted peer.
    pub fn evaluate_client(&self, source: &Path, scenario: &Scenario) -> Verdict {
        self.client_run(source, scenario)
            .unwrap_or_else(Verdict::from)
    }

    /// Evaluate a server submission with driver clients.
    pub fn evaluate_server(&self, source: &Path, scenario: &Scenario) -> Verdict {
        self.server_run(source, scenario)
            .unwrap_or_else(Verdict::from)
    }

    fn client_run(&self, source: &Path, scenario: &Scenario) -> Result<Verdict> {
        let case = &scenario.case;
        let port = port::allocate()?;
        info!(port, mode = scenario.mode.name(), label = case.label(), "client evaluation");
        let (_scratch, binary) = self.build(source, scenario, port, "client_exec")?;

        let peer = peer::start_for(scenario, port)?;
        let endpoint = Endpoint::new(peer.port());
        let count = case.client_count();

        let results = {
            let state = Arc::clone(peer.state());
            let case = case.clone();
            let timing = self.interactive.clone();
            driver::run_staggered(count, case.client_delay(), move |idx| {
                info!(client = idx + 1, total = count, "starting client");
                run_client(&binary, &case, endpoint, &timing, &state)
            })
        };
        let log = peer.shutdown();

        let outcomes: Vec<ClientOutcome> = results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|panic| ClientOutcome {
                    passed: false,
                    output: panic,
                })
            })
            .collect();
        info!(
            passed = outcomes.iter().filter(|o| o.passed).count(),
            total = count,
            errors = log.errors.len(),
            "clients finished"
        );

        if outcomes.iter().all(|o| o.passed) && log.errors.is_empty() {
            return Ok(Verdict::pass(format!("All {count} clients passed")));
        }
        let mut msg = format!(
            "Some clients failed. Expected: '{}'",
            case.expected_output
        );
        if let Some(first) = outcomes.iter().find(|o| !o.passed) {
            msg.push_str(&format!(" but got: '{}...'", first.output));
        }
        if !log.errors.is_empty() {
            msg.push_str(&format!(" Server errors: {:?}", log.errors));
        }
        Ok(Verdict::fail(msg))
    }

    fn server_run(&self, source: &Path, scenario: &Scenario) -> Result<Verdict> {
        let case = &scenario.case;
        let port = port::allocate_in_range(SERVER_PORT_BASE, SERVER_PORT_ATTEMPTS)?;
        info!(port, mode = scenario.mode.name(), label = case.label(), "server evaluation");
        let (_scratch, binary) = self.build(source, scenario, port, "server_exec")?;

        let server = SubmissionServer::start(&binary, port, &self.server)?;
        if let Err(e) = port::wait_for_server(
            port,
            case.protocol,
            self.server.ready_timeout,
            self.server.ready_interval,
        ) {
            warn!(error = %e, "server never became ready");
            server.stop();
            return Ok(Verdict::fail("Server failed to start or bind to port"));
        }

        let report = driver::run(scenario, Endpoint::new(port));
        let stderr = server.stop();
        if !stderr.trim().is_empty() {
            info!(stderr = %stderr.trim(), "server stderr");
        }
        Ok(if report.passed {
            Verdict::pass(report.message)
        } else {
            Verdict::fail(report.message)
        })
    }

    /// Copy `source` into a fresh scratch dir with its port patched, and
    /// compile it there. The scratch dir lives as long as the returned guard.
    fn build(
        &self,
        source: &Path,
        scenario: &Scenario,
        port: u16,
        name: &str,
    ) -> Result<(TempDir, PathBuf)> {
        let text = fs::read_to_string(source)?;
        let patched = patch_port(&text, scenario.case.port_pattern.as_deref(), port);
        if !patched.matched {
            warn!(src = %source.display(), "port declaration inserted, not replaced");
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("netlab-");
        let scratch = match &self.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        let src = scratch.path().join(format!("{name}.c"));
        fs::write(&src, patched.source)?;
        let out = self.compiler.compile(&src, &scratch.path().join(name))?;
        let warnings = out.diagnostics.trim();
        if !warnings.is_empty() {
            warn!(%warnings, "compiler warnings");
        }
        Ok((scratch, out.binary))
    }
}
