use std::net::TcpStream;
use std::thread;

use tracing::debug;

use super::DriverReport;
use crate::case::ReliabilityParams;
use crate::port::Endpoint;

/// Open and immediately close `attempts` connections.
pub fn run(endpoint: Endpoint, params: &ReliabilityParams) -> DriverReport {
    let attempts = params.attempts.max(1);
    let mut connected = 0u32;
    for attempt in 0..attempts {
        match TcpStream::connect_timeout(&endpoint.addr(), params.connect_timeout) {
            Ok(stream) => {
                drop(stream);
                connected += 1;
                thread::sleep(params.reconnect_delay);
            }
            Err(e) => debug!(attempt, error = %e, "connect attempt failed"),
        }
    }

    let rate = f64::from(connected) / f64::from(attempts) * 100.0;
    if rate >= params.min_success_rate {
        DriverReport::pass(format!(
            "Connection reliability test passed with {rate:.1}% success rate"
        ))
    } else {
        DriverReport::fail(format!(
            "Connection reliability test failed with only {rate:.1}% success rate"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::Duration;

    fn params(attempts: u32) -> ReliabilityParams {
        ReliabilityParams {
            attempts,
            connect_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(10),
            min_success_rate: 80.0,
        }
    }

    #[test]
    fn listening_server_is_fully_reliable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let report = run(Endpoint::new(port), &params(4));
        assert!(report.passed);
        assert!(report.message.contains("100.0%"));
    }

    #[test]
    fn absent_server_fails() {
        let port = crate::port::allocate().unwrap();
        let report = run(Endpoint::new(port), &params(2));
        assert!(!report.passed);
        assert!(report.message.contains("0.0%"));
    }
}
