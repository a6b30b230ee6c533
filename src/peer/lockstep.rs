use std::io::{self, Write};
use std::net::TcpStream;
use std::thread;

use tracing::debug;

use super::{ConnectionHandler, PeerState};
use crate::case::{ScriptStep, secs};
use crate::port::read_chunk;

const REQUEST_LIMIT: usize = 1024;

/// Reads one packet at a time and answers each with its ack, matching or not.
#[derive(Debug, Clone)]
pub struct StopAndWaitPeer {
    packets: Vec<String>,
    acks: Vec<String>,
}

impl StopAndWaitPeer {
    pub fn new(packets: Vec<String>, acks: Vec<String>) -> Self {
        Self { packets, acks }
    }
}

impl ConnectionHandler for StopAndWaitPeer {
    fn handle(&self, mut stream: TcpStream, state: &PeerState) -> io::Result<()> {
        for (seq, (packet, ack)) in self.packets.iter().zip(&self.acks).enumerate() {
            let data = read_chunk(&mut stream, REQUEST_LIMIT)?;
            debug!(seq, %data, "stop-and-wait packet");
            state.record_received(data.clone());
            if data != *packet {
                state.record_error(format!("Expected '{packet}', got '{data}'"));
            }
            stream.write_all(ack.as_bytes())?;
            stream.flush()?;
        }
        Ok(())
    }
}

/// Ordered expect/response exchange; an empty `expect` sends without reading.
#[derive(Debug, Clone)]
pub struct MultiStepPeer {
    steps: Vec<ScriptStep>,
}

impl MultiStepPeer {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }
}

impl ConnectionHandler for MultiStepPeer {
    fn handle(&self, mut stream: TcpStream, state: &PeerState) -> io::Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(expect) = step.expect.as_deref().filter(|e| !e.is_empty()) {
                let data = read_chunk(&mut stream, REQUEST_LIMIT)?;
                debug!(step = i + 1, %data, "multi-step received");
                state.record_received(data.clone());
                if data != expect {
                    state.record_error(format!("Expected '{expect}', got '{data}'"));
                }
            }
            if let Some(response) = &step.response {
                stream.write_all(response.as_bytes())?;
                stream.flush()?;
                if let Some(delay) = step.delay {
                    thread::sleep(secs(delay));
                }
            }
        }
        Ok(())
    }
}
