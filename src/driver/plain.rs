use std::io::{self, Write};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::{DriverReport, PLAIN_TIMEOUT, connect, run_staggered};
use crate::case::{ScriptStep, TestCase, secs};
use crate::port::{Endpoint, READ_CHUNK, read_chunk};
use crate::validate::validate;

const DEFAULT_REPEAT: u32 = 3;
const DEFAULT_INTERVAL: f64 = 1.0;

/// Outcome of one validated reply.
#[derive(Debug, Clone)]
struct Reply {
    valid: bool,
    output: String,
}

impl Reply {
    fn error(e: impl std::fmt::Display) -> Self {
        Self {
            valid: false,
            output: format!("Error: {e}"),
        }
    }
}

/// `clientCount` concurrent TCP clients replaying the case's steps.
pub fn run_tcp(endpoint: Endpoint, case: &TestCase, periodic: bool) -> DriverReport {
    let shared = Arc::new(case.clone());
    let steps = Arc::new(case.driver_steps());
    let results = run_staggered(case.client_count(), case.client_delay(), move |idx| {
        match tcp_client(idx, endpoint, &shared, &steps, periodic) {
            Ok(replies) => replies,
            Err(e) => {
                warn!(client = idx, error = %e, "tcp client failed");
                vec![Reply::error(e)]
            }
        }
    });
    summarize(case.client_count(), results)
}

fn tcp_client(
    idx: usize,
    endpoint: Endpoint,
    case: &TestCase,
    steps: &[ScriptStep],
    periodic: bool,
) -> io::Result<Vec<Reply>> {
    let mut stream = connect(endpoint, PLAIN_TIMEOUT)?;
    let mut replies = Vec::with_capacity(steps.len());
    for step in steps {
        let msg = step.input.as_deref().unwrap_or("");
        if periodic {
            for _ in 0..step.count.unwrap_or(DEFAULT_REPEAT) {
                stream.write_all(msg.as_bytes())?;
                thread::sleep(secs(step.interval.unwrap_or(DEFAULT_INTERVAL)));
            }
        } else {
            debug!(client = idx, %msg, "sending");
            stream.write_all(msg.as_bytes())?;
        }
        let data = read_chunk(&mut stream, READ_CHUNK)?;
        debug!(client = idx, %data, "received");
        replies.push(judge(case, step, data));
    }
    Ok(replies)
}

fn judge(case: &TestCase, step: &ScriptStep, data: String) -> Reply {
    let expected = step
        .expected_output
        .as_ref()
        .unwrap_or(&case.expected_output);
    let match_type = step.match_type.unwrap_or(case.match_type());
    let valid = validate(&data, expected, match_type).passed;
    Reply {
        valid,
        output: data,
    }
}

/// `clientCount` concurrent UDP clients, one datagram exchange each.
pub fn run_udp(endpoint: Endpoint, case: &TestCase) -> DriverReport {
    let shared = Arc::new(case.clone());
    let results = run_staggered(case.client_count(), case.client_delay(), move |idx| {
        match udp_client(idx, endpoint, &shared) {
            Ok(reply) => vec![reply],
            Err(e) => {
                warn!(client = idx, error = %e, "udp client failed");
                vec![Reply::error(e)]
            }
        }
    });
    summarize(case.client_count(), results)
}

fn udp_client(idx: usize, endpoint: Endpoint, case: &TestCase) -> io::Result<Reply> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    socket.set_read_timeout(Some(PLAIN_TIMEOUT))?;
    let msg = case.input.as_ref().map(|l| l.first()).unwrap_or("");
    debug!(client = idx, %msg, "udp sending");
    socket.send_to(msg.as_bytes(), endpoint.addr())?;
    let mut buf = vec![0u8; READ_CHUNK];
    let (n, _) = socket.recv_from(&mut buf)?;
    let data = String::from_utf8_lossy(&buf[..n]).trim().to_string();
    debug!(client = idx, %data, "udp received");
    Ok(judge(case, &ScriptStep::default(), data))
}

fn summarize(count: usize, results: Vec<Result<Vec<Reply>, String>>) -> DriverReport {
    let replies: Vec<Reply> = results
        .into_iter()
        .flat_map(|r| r.unwrap_or_else(|panic| vec![Reply::error(panic)]))
        .collect();
    let summary = replies
        .iter()
        .map(|r| r.output.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if replies.iter().all(|r| r.valid) {
        DriverReport::pass(format!("All {count} clients passed: {summary}"))
    } else {
        let failed: Vec<&str> = replies
            .iter()
            .filter(|r| !r.valid)
            .map(|r| r.output.as_str())
            .collect();
        DriverReport::fail(format!(
            "Server output: {summary}. Failed outputs: {failed:?}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ScriptedPeer, start_tcp, udp};
    use crate::validate::Expected;
    use std::time::Duration;

    fn echo_script() -> Vec<ScriptStep> {
        vec![ScriptStep {
            expect: Some("hello".into()),
            response: Some("world".into()),
            delay: Some(0.0),
            ..Default::default()
        }]
    }

    fn case(count: usize) -> TestCase {
        TestCase {
            client_count: count,
            client_delay: 0.1,
            steps: Some(vec![ScriptStep {
                input: Some("hello".into()),
                expected_output: Some(Expected::from("world")),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn three_staggered_clients_all_pass() {
        let peer = start_tcp(
            0,
            Arc::new(ScriptedPeer::new(echo_script(), false)),
            Duration::from_secs(2),
        )
        .unwrap();
        let report = run_tcp(Endpoint::new(peer.port()), &case(3), false);
        assert!(report.passed, "{}", report.message);
        assert!(report.message.starts_with("All 3 clients passed"));
        assert!(peer.shutdown().errors.is_empty());
    }

    #[test]
    fn wrong_reply_fails_with_outputs() {
        let peer = start_tcp(
            0,
            Arc::new(ScriptedPeer::new(echo_script(), false)),
            Duration::from_secs(2),
        )
        .unwrap();
        let mut c = case(1);
        c.expected_output = Expected::from("world");
        c.steps.as_mut().unwrap()[0].expected_output = Some(Expected::from("planet"));
        let report = run_tcp(Endpoint::new(peer.port()), &c, false);
        assert!(!report.passed);
        assert!(report.message.contains("Failed outputs: [\"world\"]"));
        peer.shutdown();
    }

    #[test]
    fn refused_connection_is_a_failure() {
        let port = crate::port::allocate().unwrap();
        let report = run_tcp(Endpoint::new(port), &case(1), false);
        assert!(!report.passed);
        assert!(report.message.contains("Error:"));
    }

    #[test]
    fn udp_client_validates_reply() {
        let peer = udp::start(0, vec![ScriptStep::respond("PONG")]).unwrap();
        let c = TestCase {
            input: Some(crate::case::Lines::One("PING".into())),
            expected_output: Expected::from("PONG"),
            ..Default::default()
        };
        let report = run_udp(Endpoint::new(peer.port()), &c);
        assert!(report.passed, "{}", report.message);
        peer.shutdown();
    }
}
