use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::{Inflight, PeerHandle, PeerState};
use crate::case::ScriptStep;
use crate::port::READ_CHUNK;
use crate::validate::MatchType;

const RECV_POLL: Duration = Duration::from_millis(100);

/// Pick the reply for one datagram.
///
/// A step matches when its `expect` equals the payload. Steps with
/// `matchType: regex` also match when `expect` occurs in the payload as
/// plain text or as a pattern. Without a match the first step's response
/// is the default.
pub fn reply_for<'a>(script: &'a [ScriptStep], data: &str) -> Option<&'a str> {
    let hit = script.iter().find(|step| {
        let Some(expect) = &step.expect else {
            return false;
        };
        if expect == data {
            return true;
        }
        step.match_type == Some(MatchType::Regex)
            && (data.contains(expect.as_str())
                || Regex::new(expect).is_ok_and(|re| re.is_match(data)))
    });
    hit.and_then(|s| s.response.as_deref())
        .or_else(|| script.first().and_then(|s| s.response.as_deref()))
}

/// Serve `script` on a UDP socket, one reply per datagram.
pub fn start(port: u16, script: Vec<ScriptStep>) -> io::Result<PeerHandle> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))?;
    let port = socket.local_addr()?.port();
    socket.set_read_timeout(Some(RECV_POLL))?;

    let state = PeerState::new();
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done) = mpsc::channel();

    let thread = {
        let state = state.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name(format!("peer-udp-{port}"))
            .spawn(move || {
                serve(&socket, &script, &state, &stop);
                let _ = done_tx.send(());
            })?
    };
    info!(port, "udp peer listening");

    Ok(PeerHandle {
        port,
        state,
        stop,
        inflight: Arc::new(Inflight::default()),
        done,
        thread: Some(thread),
    })
}

fn serve(socket: &UdpSocket, script: &[ScriptStep], state: &PeerState, stop: &AtomicBool) {
    let mut buf = vec![0u8; READ_CHUNK];
    while !stop.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "udp peer recv failed");
                continue;
            }
        };
        let data = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        debug!(%from, %data, "udp datagram");
        state.record_received(data.clone());
        if let Some(reply) = reply_for(script, &data)
            && let Err(e) = socket.send_to(reply.as_bytes(), from)
        {
            state.record_error(format!("Error: {e}"));
        }
    }
}
