//! Driver clients: the other side of the conversation when the submission
//! under test is a server.

use std::any::Any;
use std::io;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::case::{Scenario, TestMode};
use crate::port::Endpoint;

pub mod chatroom;
pub mod error_handling;
pub mod lockstep;
pub mod performance;
pub mod plain;
pub mod reliability;

/// Connect timeout for the plain TCP/UDP drivers.
pub const PLAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Connect timeout for single-connection scenario drivers.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(3);

/// Verdict of one driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    pub passed: bool,
    pub message: String,
}

impl DriverReport {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Connect with `timeout` applied to the connect and to every read/write.
pub fn connect(endpoint: Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&endpoint.addr(), timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "driver thread panicked".into())
}

/// Run `count` instances of `f` on their own threads, starting each one
/// `delay` after the previous start, and collect results in start order.
pub fn run_staggered<T, F>(count: usize, delay: Duration, f: F) -> Vec<Result<T, String>>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let f = std::sync::Arc::new(f);
    let mut handles = Vec::with_capacity(count);
    for idx in 0..count {
        debug!(idx, total = count, "starting instance");
        let f = f.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("driver-{idx}"))
                .spawn(move || f(idx)),
        );
        if idx + 1 < count {
            thread::sleep(delay);
        }
    }
    handles
        .into_iter()
        .map(|h| match h {
            Ok(h) => h.join().map_err(panic_message),
            Err(e) => Err(format!("could not start instance: {e}")),
        })
        .collect()
}

/// Drive a submission server listening on `endpoint`.
pub fn run(scenario: &Scenario, endpoint: Endpoint) -> DriverReport {
    let case = &scenario.case;
    info!(mode = scenario.mode.name(), port = endpoint.port, "running drivers");
    match &scenario.mode {
        TestMode::Chatroom { messages } => chatroom::run(endpoint, messages, case.deadline()),
        TestMode::StopAndWait { packets, acks } => lockstep::stop_and_wait(
            endpoint,
            packets,
            acks,
            case.match_type.unwrap_or(crate::validate::MatchType::Exact),
        ),
        TestMode::MultiStep => lockstep::multi_step(endpoint, &case.driver_steps()),
        TestMode::ErrorHandling { tests } => error_handling::run(endpoint, tests),
        TestMode::ConnectionReliability(params) => reliability::run(endpoint, params),
        TestMode::Performance(params) => performance::run(endpoint, params),
        TestMode::Udp => plain::run_udp(endpoint, case),
        TestMode::Tcp { periodic } => plain::run_tcp(endpoint, case, *periodic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn staggered_starts_are_spaced_and_ordered() {
        let starts = std::sync::Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();
        let rec = starts.clone();
        let out = run_staggered(3, Duration::from_millis(50), move |i| {
            rec.lock().unwrap().push(t0.elapsed());
            i * 10
        });
        let out: Vec<usize> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out, vec![0, 10, 20]);
        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        assert!(starts[2] >= Duration::from_millis(100));
    }

    #[test]
    fn panicking_instance_becomes_error() {
        let out = run_staggered(2, Duration::ZERO, |i| {
            if i == 1 {
                panic!("instance blew up");
            }
            i
        });
        assert_eq!(out[0], Ok(0));
        assert_eq!(out[1], Err("instance blew up".to_string()));
    }
}
