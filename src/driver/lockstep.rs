use std::io::{self, Write};

use tracing::debug;

use super::{DriverReport, SCENARIO_TIMEOUT, connect};
use crate::case::ScriptStep;
use crate::port::{Endpoint, READ_CHUNK, read_chunk};
use crate::validate::{Expected, MatchType, validate};

/// Send each packet and wait for its ack; the first bad ack fails the run.
pub fn stop_and_wait(
    endpoint: Endpoint,
    packets: &[String],
    acks: &[String],
    match_type: MatchType,
) -> DriverReport {
    let outcome = (|| -> io::Result<DriverReport> {
        let mut stream = connect(endpoint, SCENARIO_TIMEOUT)?;
        for (packet, expected) in packets.iter().zip(acks) {
            stream.write_all(packet.as_bytes())?;
            let ack = read_chunk(&mut stream, READ_CHUNK)?;
            debug!(%packet, %ack, "stop-and-wait ack");
            if !validate(&ack, &Expected::from(expected.as_str()), match_type).passed {
                return Ok(DriverReport::fail(format!("Expected {expected}, got {ack}")));
            }
        }
        Ok(DriverReport::pass("Stop-and-wait simulation successful"))
    })();
    outcome.unwrap_or_else(|e| DriverReport::fail(format!("Error: {e}")))
}

/// Strict send/receive/validate over `steps`.
pub fn multi_step(endpoint: Endpoint, steps: &[ScriptStep]) -> DriverReport {
    let outcome = (|| -> io::Result<DriverReport> {
        let mut stream = connect(endpoint, SCENARIO_TIMEOUT)?;
        for (i, step) in steps.iter().enumerate() {
            stream.write_all(step.input.as_deref().unwrap_or("").as_bytes())?;
            let data = read_chunk(&mut stream, READ_CHUNK)?;
            debug!(step = i + 1, %data, "multi-step reply");
            let expected = step.expected_output.clone().unwrap_or_default();
            let match_type = step.match_type.unwrap_or_default();
            if !validate(&data, &expected, match_type).passed {
                return Ok(DriverReport::fail(format!("Expected {expected}, got {data}")));
            }
        }
        Ok(DriverReport::pass("Multi-step protocol test passed"))
    })();
    outcome.unwrap_or_else(|e| DriverReport::fail(format!("Error: {e}")))
}
