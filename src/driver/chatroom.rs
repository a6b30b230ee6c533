use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{DriverReport, SCENARIO_TIMEOUT, connect, run_staggered};
use crate::port::{Endpoint, READ_CHUNK, read_chunk};
use crate::validate::set_matches;

/// One participant per message; each must see every other message once.
pub fn run(endpoint: Endpoint, messages: &[String], deadline: Duration) -> DriverReport {
    let all = Arc::new(messages.to_vec());
    let n = all.len();
    let participants = all.clone();
    let received = run_staggered(n, Duration::ZERO, move |idx| {
        participant(endpoint, &participants[idx], n.saturating_sub(1), deadline)
    });

    for (idx, got) in received.into_iter().enumerate() {
        let got = match got {
            Ok(Ok(got)) => got,
            Ok(Err(e)) => return DriverReport::fail(format!("Client {idx} error: {e}")),
            Err(panic) => return DriverReport::fail(format!("Client {idx} error: {panic}")),
        };
        let others: Vec<String> = all.iter().filter(|m| **m != all[idx]).cloned().collect();
        if !set_matches(&got, &others) {
            return DriverReport::fail(format!(
                "Client {idx} did not receive all other messages: {got:?}"
            ));
        }
    }
    DriverReport::pass("All clients received all chat messages")
}

/// Send `mine`, then gather up to `want` relayed messages before `deadline`.
///
/// Each read may carry several newline-separated messages or a single
/// unterminated one.
fn participant(
    endpoint: Endpoint,
    mine: &str,
    want: usize,
    deadline: Duration,
) -> io::Result<Vec<String>> {
    let mut stream = connect(endpoint, SCENARIO_TIMEOUT)?;
    stream.write_all(mine.as_bytes())?;
    let start = Instant::now();
    let mut got = Vec::new();
    while got.len() < want {
        let left = deadline.saturating_sub(start.elapsed());
        if left.is_zero() {
            break;
        }
        stream.set_read_timeout(Some(left))?;
        let chunk = match read_chunk(&mut stream, READ_CHUNK) {
            Ok(c) => c,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break;
            }
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            break;
        }
        got.extend(
            chunk
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    debug!(%mine, ?got, "chat participant done");
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ChatroomPeer, start_tcp};

    fn msgs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn three_participants_pass_against_relay() {
        let relay = Arc::new(ChatroomPeer::new(3, Duration::from_secs(5)));
        let peer = start_tcp(0, relay, Duration::from_secs(5)).unwrap();
        let report = run(
            Endpoint::new(peer.port()),
            &msgs(&["hi", "yo", "sup"]),
            Duration::from_secs(5),
        );
        assert!(report.passed, "{}", report.message);
        assert!(peer.shutdown().errors.is_empty());
    }

    #[test]
    fn relay_expecting_more_participants_fails_within_deadline() {
        let relay = Arc::new(ChatroomPeer::new(4, Duration::from_millis(300)));
        let peer = start_tcp(0, relay, Duration::from_secs(2)).unwrap();
        let start = Instant::now();
        let report = run(
            Endpoint::new(peer.port()),
            &msgs(&["hi", "yo", "sup"]),
            Duration::from_secs(1),
        );
        assert!(!report.passed);
        assert!(start.elapsed() < Duration::from_secs(3));
        let log = peer.shutdown();
        assert!(!log.errors.is_empty());
    }
}
