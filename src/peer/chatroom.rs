use std::io;
use std::net::TcpStream;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::{ConnectionHandler, PeerState};
use crate::port::{read_chunk, write_line};

const MESSAGE_LIMIT: usize = 1024;

/// Chat relay: every participant sends one message, and once all
/// `expected` have arrived each one receives everybody else's message in
/// arrival order.
#[derive(Debug)]
pub struct ChatroomPeer {
    expected: usize,
    deadline: Duration,
    messages: Mutex<Vec<String>>,
    arrived: Condvar,
}

impl ChatroomPeer {
    pub fn new(expected: usize, deadline: Duration) -> Self {
        Self {
            expected: expected.max(1),
            deadline,
            messages: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }
}

impl ConnectionHandler for ChatroomPeer {
    fn handle(&self, mut stream: TcpStream, state: &PeerState) -> io::Result<()> {
        let data = read_chunk(&mut stream, MESSAGE_LIMIT)?;
        state.record_received(data.clone());

        let mut log = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        log.push(data);
        let me = log.len() - 1;
        debug!(participant = me, arrived = log.len(), expected = self.expected, "chat message");
        self.arrived.notify_all();

        let (log, wait) = self
            .arrived
            .wait_timeout_while(log, self.deadline, |l| l.len() < self.expected)
            .unwrap_or_else(|p| p.into_inner());
        if wait.timed_out() && log.len() < self.expected {
            let arrived = log.len();
            drop(log);
            warn!(arrived, expected = self.expected, "chatroom rendezvous timed out");
            state.record_error(format!(
                "Chatroom timed out after {:.1}s: {} of {} participants sent a message",
                self.deadline.as_secs_f64(),
                arrived,
                self.expected
            ));
            return Ok(());
        }

        let others: Vec<String> = log
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != me)
            .map(|(_, m)| m.clone())
            .collect();
        drop(log);
        for msg in &others {
            write_line(&mut stream, msg)?;
        }
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
    use std::thread;

    fn participant(port: u16, msg: &'static str) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let mut s = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            s.write_all(msg.as_bytes()).unwrap();
            let mut out = String::new();
            s.read_to_string(&mut out).unwrap();
            out
        })
    }

    #[test]
    fn relays_other_messages_once_all_arrive() {
        let peer = Arc::new(ChatroomPeer::new(3, Duration::from_secs(5)));
        let peer = start_tcp(0, peer, Duration::from_secs(5)).unwrap();
        let port = peer.port();
        let handles: Vec<_> = ["hi", "yo", "sup"]
            .into_iter()
            .map(|m| (m, participant(port, m)))
            .collect();
        for (mine, h) in handles {
            let got = h.join().unwrap();
            let mut lines: Vec<&str> = got.lines().collect();
            lines.sort_unstable();
            let mut want: Vec<&str> = ["hi", "yo", "sup"]
                .into_iter()
                .filter(|m| *m != mine)
                .collect();
            want.sort_unstable();
            assert_eq!(lines, want, "participant {mine}");
        }
        let log = peer.shutdown();
        assert!(log.errors.is_empty());
        assert_eq!(log.received.len(), 3);
    }

    #[test]
    fn missing_participant_times_out_with_error() {
        let peer = Arc::new(ChatroomPeer::new(3, Duration::from_millis(300)));
        let peer = start_tcp(0, peer, Duration::from_secs(2)).unwrap();
        let port = peer.port();
        let a = participant(port, "hi");
        let b = participant(port, "yo");
        assert_eq!(a.join().unwrap(), "");
        assert_eq!(b.join().unwrap(), "");
        let log = peer.shutdown();
        assert_eq!(log.errors.len(), 2);
        assert!(log.errors[0].contains("2 of 3 participants"));
    }
}
