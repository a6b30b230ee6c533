use std::io::{self, Read, Write};
use std::time::Instant;

use tracing::{debug, warn};

use super::{DriverReport, SCENARIO_TIMEOUT, connect, run_staggered};
use crate::case::PerformanceParams;
use crate::port::{Endpoint, READ_CHUNK};
use crate::stats::LatencyStats;

/// Concurrent clients each doing `num_requests` synchronous round-trips.
pub fn run(endpoint: Endpoint, params: &PerformanceParams) -> DriverReport {
    let clients = params.concurrent_clients.max(1);
    let p = params.clone();
    let results = run_staggered(clients, std::time::Duration::ZERO, move |idx| {
        client(idx, endpoint, &p)
    });

    let mut all = LatencyStats::new();
    let mut succeeded = 0usize;
    for (idx, result) in results.into_iter().enumerate() {
        match result {
            Ok(Ok(stats)) => {
                all.merge(&stats);
                let avg = stats.avg().unwrap_or_default();
                if avg <= params.max_response_time {
                    succeeded += 1;
                } else {
                    debug!(client = idx, ?avg, "client too slow");
                }
            }
            Ok(Err(e)) => {
                all.inc_bad();
                warn!(client = idx, error = %e, "performance client failed");
            }
            Err(panic) => {
                all.inc_bad();
                warn!(client = idx, %panic, "performance client panicked");
            }
        }
    }

    debug!(ok = all.ok, bad = all.bad, bytes = all.bytes, "performance totals");
    if all.is_empty() {
        return DriverReport::fail("No successful responses received");
    }
    if succeeded == clients {
        DriverReport::pass(format!("Performance test passed: {}", all.summary()))
    } else {
        DriverReport::fail(format!(
            "Performance test failed: {succeeded}/{clients} clients succeeded, {}",
            all.summary()
        ))
    }
}

fn client(idx: usize, endpoint: Endpoint, params: &PerformanceParams) -> io::Result<LatencyStats> {
    let payload = "X".repeat(params.message_size);
    let mut stream = connect(endpoint, SCENARIO_TIMEOUT)?;
    let mut stats = LatencyStats::new();
    let mut buf = vec![0u8; READ_CHUNK];
    for _ in 0..params.num_requests.max(1) {
        let start = Instant::now();
        stream.write_all(payload.as_bytes())?;
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        stats.record(start.elapsed(), n);
    }
    debug!(client = idx, summary = %stats.summary(), "performance client done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;
    use std::time::Duration;

    fn echo_server(reply_delay: Duration) -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut s) = stream else { break };
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = s.read(&mut buf) {
                        if n == 0 {
                            break;
                        }
                        thread::sleep(reply_delay);
                        if s.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn params(max: Duration) -> PerformanceParams {
        PerformanceParams {
            message_size: 64,
            num_requests: 5,
            max_response_time: max,
            concurrent_clients: 2,
        }
    }

    #[test]
    fn fast_echo_passes_and_reports_latency() {
        let port = echo_server(Duration::ZERO);
        let report = run(Endpoint::new(port), &params(Duration::from_millis(500)));
        assert!(report.passed, "{}", report.message);
        assert!(report.message.contains("avg="));
        assert!(report.message.contains("min="));
        assert!(report.message.contains("max="));
    }

    #[test]
    fn slow_echo_fails() {
        let port = echo_server(Duration::from_millis(30));
        let report = run(Endpoint::new(port), &params(Duration::from_millis(5)));
        assert!(!report.passed);
        assert!(report.message.contains("0/2 clients succeeded"));
    }

    #[test]
    fn no_server_reports_no_responses() {
        let port = crate::port::allocate().unwrap();
        let report = run(Endpoint::new(port), &params(Duration::from_millis(500)));
        assert_eq!(report.message, "No successful responses received");
    }
}
