use std::io;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{ConnectionHandler, PeerState};
use crate::case::{ScriptStep, secs};
use crate::port::{read_chunk, write_line};

const REQUEST_LIMIT: usize = 1024;
const PROMPT_PAUSE: Duration = Duration::from_millis(200);
const DEFAULT_DELAY: f64 = 0.1;
const INTERACTIVE_DELAY: f64 = 0.3;

/// Replays a request/response script on every connection.
///
/// In interactive mode a leading response-only step is treated as the
/// prompt: it is sent once on connect, and later responses repeating it
/// are not sent again since the client already shows it.
#[derive(Debug, Clone)]
pub struct ScriptedPeer {
    script: Vec<ScriptStep>,
    interactive: bool,
}

impl ScriptedPeer {
    pub fn new(script: Vec<ScriptStep>, interactive: bool) -> Self {
        Self {
            script,
            interactive,
        }
    }

    /// Leading prompt, if the script starts with one.
    fn prompt(&self) -> Option<&str> {
        let first = self.script.first()?;
        match (&first.expect, &first.response) {
            (None, Some(r)) if self.interactive => Some(r.as_str()),
            _ => None,
        }
    }
}

/// `expect` matches when empty, equal to `data`, or contained in it.
pub fn loosely_matches(expect: &str, data: &str) -> bool {
    expect.is_empty() || data == expect || data.contains(expect)
}

impl ConnectionHandler for ScriptedPeer {
    fn handle(&self, mut stream: TcpStream, state: &PeerState) -> io::Result<()> {
        let mut steps = self.script.as_slice();
        let prompt = self.prompt().map(|p| p.trim().to_string());
        if let Some(p) = &prompt {
            debug!(prompt = %p, "sending initial prompt");
            write_line(&mut stream, p)?;
            thread::sleep(PROMPT_PAUSE);
            steps = &steps[1..];
        }
        let default_delay = if self.interactive {
            INTERACTIVE_DELAY
        } else {
            DEFAULT_DELAY
        };

        for (i, step) in steps.iter().enumerate() {
            if let Some(expect) = &step.expect {
                let data = read_chunk(&mut stream, REQUEST_LIMIT)?;
                debug!(step = i + 1, %data, "received");
                state.record_received(data.clone());
                if !loosely_matches(expect, &data) {
                    state.record_error(format!("Expected '{expect}', got '{data}'"));
                }
            }
            if let Some(response) = &step.response {
                if let Some(p) = &prompt
                    && !p.is_empty()
                    && response.trim().starts_with(p.as_str())
                {
                    debug!(step = i + 1, "skipping repeated prompt");
                    continue;
                }
                debug!(step = i + 1, response = %response.trim_end(), "sending");
                write_line(&mut stream, response)?;
                thread::sleep(secs(step.delay.unwrap_or(default_delay)));
            }
        }
        debug!("scripted connection finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::start_tcp;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn step(expect: Option<&str>, response: Option<&str>) -> ScriptStep {
        ScriptStep {
            expect: expect.map(str::to_string),
            response: response.map(str::to_string),
            delay: Some(0.0),
            ..Default::default()
        }
    }

    fn read_reply(s: &mut TcpStream) -> String {
        let mut buf = [0u8; 256];
        let n = s.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[test]
    fn loose_match_rules() {
        assert!(loosely_matches("", "anything"));
        assert!(loosely_matches("2+3", "2+3"));
        assert!(loosely_matches("2+3", "calc 2+3 please"));
        assert!(!loosely_matches("2+3", "2*3"));
    }

    #[test]
    fn replies_and_records_mismatch_without_aborting() {
        let peer = ScriptedPeer::new(
            vec![step(Some("HELLO"), Some("WELCOME")), step(Some("BYE"), Some("CIAO"))],
            false,
        );
        let peer = start_tcp(0, Arc::new(peer), Duration::from_secs(2)).unwrap();
        let mut s = TcpStream::connect((Ipv4Addr::LOCALHOST, peer.port())).unwrap();
        s.write_all(b"HELLO").unwrap();
        assert_eq!(read_reply(&mut s), "WELCOME\n");
        s.write_all(b"NOPE").unwrap();
        assert_eq!(read_reply(&mut s), "CIAO\n");
        drop(s);
        let log = peer.shutdown();
        assert_eq!(log.received, vec!["HELLO", "NOPE"]);
        assert_eq!(log.errors, vec!["Expected 'BYE', got 'NOPE'"]);
    }

    #[test]
    fn interactive_prompt_is_sent_once() {
        let peer = ScriptedPeer::new(
            vec![
                step(None, Some("Enter expression:")),
                step(Some("2 + 3"), Some("Result: 5")),
                step(None, Some("Enter expression:")),
                step(Some("4 * 2"), Some("Result: 8")),
            ],
            true,
        );
        let peer = start_tcp(0, Arc::new(peer), Duration::from_secs(2)).unwrap();
        let mut s = TcpStream::connect((Ipv4Addr::LOCALHOST, peer.port())).unwrap();
        assert_eq!(read_reply(&mut s), "Enter expression:\n");
        s.write_all(b"2 + 3\n").unwrap();
        assert_eq!(read_reply(&mut s), "Result: 5\n");
        s.write_all(b"4 * 2\n").unwrap();
        assert_eq!(read_reply(&mut s), "Result: 8\n");
        drop(s);
        let log = peer.shutdown();
        assert!(log.errors.is_empty(), "{:?}", log.errors);
    }
}
