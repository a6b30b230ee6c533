//! Declarative test cases as loaded from the JSON test-case file.
//!
//! Field names follow the file format (camelCase). Every field has a
//! default so that hand-written cases only spell out what they need.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{EvalError, Result};
use crate::validate::{Expected, MatchType};

pub mod mode;

pub use mode::{PerformanceParams, ReliabilityParams, TestMode};

const MAX_SECONDS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// One or many lines of scripted stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Lines {
    One(String),
    Many(Vec<String>),
}

impl Lines {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Lines::One(s) => vec![s.clone()],
            Lines::Many(v) => v.clone(),
        }
    }
    /// First line, used as the payload by single-shot drivers.
    pub fn first(&self) -> &str {
        match self {
            Lines::One(s) => s,
            Lines::Many(v) => v.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// Ordered unit of a script.
///
/// Peers use `expect`/`response`/`delay`; drivers use
/// `input`/`expectedOutput`/`matchType`/`count`/`interval`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptStep {
    pub expect: Option<String>,
    pub response: Option<String>,
    pub delay: Option<f64>,
    pub input: Option<String>,
    pub expected_output: Option<Expected>,
    pub match_type: Option<MatchType>,
    pub count: Option<u32>,
    pub interval: Option<f64>,
}

impl ScriptStep {
    pub fn respond(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
            ..Default::default()
        }
    }
}

/// One malformed input for the error-handling driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTest {
    pub input: String,
    #[serde(default = "default_error_marker")]
    pub expected_output: String,
    #[serde(default)]
    pub match_type: Option<MatchType>,
    #[serde(default)]
    pub description: String,
}

fn default_error_marker() -> String {
    "ERROR".into()
}

impl ErrorTest {
    fn new(input: &str, description: &str) -> Self {
        Self {
            input: input.into(),
            expected_output: default_error_marker(),
            match_type: None,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestCase {
    pub description: Option<String>,
    pub protocol: Protocol,
    pub client_count: usize,
    pub client_delay: f64,

    pub chatroom: bool,
    pub stop_and_wait: bool,
    pub multi_step: bool,
    pub periodic_send: bool,
    pub error_handling: bool,
    pub connection_reliability: bool,
    pub performance: bool,
    pub interactive: bool,

    pub server_script: Option<Vec<ScriptStep>>,
    pub server_response: Option<String>,
    pub steps: Option<Vec<ScriptStep>>,

    pub input: Option<Lines>,
    pub expected_output: Expected,
    pub match_type: Option<MatchType>,
    pub expected_formula: Option<String>,
    pub timeout: f64,
    pub port_pattern: Option<String>,
    pub deadline: f64,

    pub packets: Option<Vec<String>>,
    pub acks_expected: Option<Vec<String>>,
    pub chat_messages: Option<Vec<String>>,
    pub error_tests: Option<Vec<ErrorTest>>,

    pub connection_attempts: u32,
    pub connection_timeout: f64,
    pub reconnect_delay: f64,
    pub min_success_rate: f64,

    pub message_size: usize,
    pub num_requests: usize,
    pub max_response_time: f64,
    pub concurrent_clients: usize,
}

impl Default for TestCase {
    fn default() -> Self {
        Self {
            description: None,
            protocol: Protocol::Tcp,
            client_count: 1,
            client_delay: 0.2,
            chatroom: false,
            stop_and_wait: false,
            multi_step: false,
            periodic_send: false,
            error_handling: false,
            connection_reliability: false,
            performance: false,
            interactive: false,
            server_script: None,
            server_response: None,
            steps: None,
            input: None,
            expected_output: Expected::default(),
            match_type: None,
            expected_formula: None,
            timeout: 10.0,
            port_pattern: None,
            deadline: 10.0,
            packets: None,
            acks_expected: None,
            chat_messages: None,
            error_tests: None,
            connection_attempts: 5,
            connection_timeout: 1.0,
            reconnect_delay: 0.5,
            min_success_rate: 80.0,
            message_size: 1024,
            num_requests: 10,
            max_response_time: 0.5,
            concurrent_clients: 5,
        }
    }
}

impl TestCase {
    pub fn client_count(&self) -> usize {
        self.client_count.max(1)
    }
    pub fn client_delay(&self) -> Duration {
        secs(self.client_delay)
    }
    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
    pub fn deadline(&self) -> Duration {
        secs(self.deadline)
    }
    pub fn match_type(&self) -> MatchType {
        self.match_type.unwrap_or_default()
    }

    /// Script replayed by the default scripted peer.
    pub fn server_script(&self) -> Vec<ScriptStep> {
        match &self.server_script {
            Some(script) => script.clone(),
            None => vec![ScriptStep::respond(
                self.server_response.as_deref().unwrap_or("OK\n"),
            )],
        }
    }

    /// Steps of a multi-step exchange, as seen by the peer.
    pub fn peer_steps(&self) -> Vec<ScriptStep> {
        match &self.steps {
            Some(steps) => steps.clone(),
            None => vec![ScriptStep::respond("OK")],
        }
    }

    /// Steps a plain driver sends; a case without steps sends its `input`.
    pub fn driver_steps(&self) -> Vec<ScriptStep> {
        match &self.steps {
            Some(steps) => steps.clone(),
            None => vec![ScriptStep {
                input: Some(
                    self.input
                        .as_ref()
                        .map(|l| l.first().to_string())
                        .unwrap_or_default(),
                ),
                ..Default::default()
            }],
        }
    }

    pub fn packets(&self) -> Vec<String> {
        self.packets
            .clone()
            .unwrap_or_else(|| vec!["pkt1".into(), "pkt2".into(), "pkt3".into()])
    }
    pub fn acks(&self) -> Vec<String> {
        self.acks_expected
            .clone()
            .unwrap_or_else(|| vec!["ACK1".into(), "ACK2".into(), "ACK3".into()])
    }
    pub fn chat_messages(&self) -> Vec<String> {
        self.chat_messages
            .clone()
            .unwrap_or_else(|| vec!["Hello".into(), "World".into()])
    }
    pub fn error_tests(&self) -> Vec<ErrorTest> {
        self.error_tests.clone().unwrap_or_else(|| {
            vec![
                ErrorTest::new("INVALID", "Invalid command"),
                ErrorTest::new("!@#$%", "Malformed input"),
            ]
        })
    }

    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// A test case together with the interaction mode it resolved to.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub case: TestCase,
    pub mode: TestMode,
}

impl From<TestCase> for Scenario {
    fn from(case: TestCase) -> Self {
        let mode = TestMode::from_case(&case);
        Self { case, mode }
    }
}

#[derive(Deserialize)]
struct CaseFile {
    #[serde(rename = "testCases")]
    test_cases: CaseList,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaseList {
    Flat(Vec<Value>),
    Split { client: Vec<Value> },
}

/// Pick test case `index` out of a test-case document.
pub fn parse_scenario(text: &str, index: usize) -> Result<Scenario> {
    let file: CaseFile =
        serde_json::from_str(text).map_err(|e| EvalError::Load(e.to_string()))?;
    let cases = match file.test_cases {
        CaseList::Flat(v) => v,
        CaseList::Split { client } => client,
    };
    let total = cases.len();
    let raw = cases
        .into_iter()
        .nth(index)
        .ok_or_else(|| EvalError::Load(format!("index {index} out of range ({total} cases)")))?;
    let case: TestCase = serde_json::from_value(raw).map_err(|e| EvalError::Load(e.to_string()))?;
    Ok(case.into())
}

pub fn load_scenario(path: &Path, index: usize) -> Result<Scenario> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EvalError::Load(format!("{}: {}", path.display(), e)))?;
    parse_scenario(&text, index)
}

/// Seconds from the test-case file as a `Duration`, clamped to sane bounds.
pub fn secs(v: f64) -> Duration {
    if v.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(v.clamp(0.0, MAX_SECONDS))
}
