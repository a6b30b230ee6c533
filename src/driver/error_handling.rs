use std::io::Write;

use tracing::debug;

use super::{DriverReport, SCENARIO_TIMEOUT, connect};
use crate::case::ErrorTest;
use crate::port::{Endpoint, READ_CHUNK, read_chunk};
use crate::validate::{Expected, validate};

/// Send each malformed input over one connection and expect an error reply.
pub fn run(endpoint: Endpoint, tests: &[ErrorTest]) -> DriverReport {
    let mut stream = match connect(endpoint, SCENARIO_TIMEOUT) {
        Ok(s) => s,
        Err(e) => return DriverReport::fail(format!("Error: {e}")),
    };

    let mut failed = Vec::new();
    for test in tests {
        let reply = stream
            .write_all(test.input.as_bytes())
            .and_then(|()| read_chunk(&mut stream, READ_CHUNK));
        let (valid, got) = match reply {
            Ok(data) => {
                let expected = Expected::from(test.expected_output.as_str());
                let v = validate(&data, &expected, test.match_type.unwrap_or_default());
                (v.passed, data)
            }
            Err(e) => (false, format!("Error: {e}")),
        };
        debug!(input = %test.input, %got, valid, "error-handling probe");
        if !valid {
            failed.push(format!("{}: got '{}'", test.description, got));
        }
    }

    if failed.is_empty() {
        DriverReport::pass("Server handled all error conditions appropriately")
    } else {
        DriverReport::fail(format!(
            "Server failed to handle some error conditions: {failed:?}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::TestCase;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    /// Replies ERROR to anything not starting with "GET".
    fn strict_server(rejects: bool) -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            while let Ok(n) = s.read(&mut buf) {
                if n == 0 {
                    break;
                }
                let reply: &[u8] = if rejects && !buf[..n].starts_with(b"GET") {
                    b"ERROR: bad request\n"
                } else {
                    b"OK\n"
                };
                if s.write_all(reply).is_err() {
                    break;
                }
            }
        });
        port
    }

    #[test]
    fn default_battery_passes_when_server_rejects() {
        let tests = TestCase::default().error_tests();
        let report = run(Endpoint::new(strict_server(true)), &tests);
        assert!(report.passed, "{}", report.message);
    }

    #[test]
    fn accepting_garbage_fails() {
        let tests = TestCase::default().error_tests();
        let report = run(Endpoint::new(strict_server(false)), &tests);
        assert!(!report.passed);
        assert!(report.message.contains("Invalid command: got 'OK'"));
    }
}
