use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::case::Protocol;
use crate::error::{EvalError, Result};

pub const LOCALHOST: &str = "localhost";
/// Largest single read used by peers and drivers.
pub const READ_CHUNK: usize = 4096;

const RANGE_CEILING: u16 = 65000;

/// Loopback endpoint for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
}

impl Endpoint {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Reserve an OS-assigned port on loopback and release it again.
pub fn allocate() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!(port, "allocated ephemeral port");
    Ok(port)
}

/// Probe random ports starting at `start`, giving up after `attempts` binds.
pub fn allocate_in_range(start: u16, attempts: u32) -> Result<u16> {
    let mut rng = rand::thread_rng();
    let start = start.min(RANGE_CEILING - 1);
    for attempt in 0..attempts {
        let port = if attempt == 0 {
            rng.gen_range(start..=RANGE_CEILING)
        } else {
            start.saturating_add(rng.gen_range(1..=1000))
        };
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                info!(port, "found free port");
                return Ok(port);
            }
            Err(e) => warn!(port, error = %e, "port is not available"),
        }
    }
    Err(EvalError::PortExhausted { attempts })
}

/// Poll until something owns `port`.
///
/// TCP succeeds on the first accepted connect. UDP succeeds once binding
/// the port ourselves fails.
pub fn wait_for_server(
    port: u16,
    protocol: Protocol,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let addr = Endpoint::new(port).addr();
    let start = Instant::now();
    let mut attempts = 0u32;
    info!(port, ?protocol, "waiting for server to bind");
    while start.elapsed() < timeout {
        attempts += 1;
        let ready = match protocol {
            Protocol::Tcp => TcpStream::connect_timeout(&addr, interval).is_ok(),
            Protocol::Udp => UdpSocket::bind(addr).is_err(),
        };
        if ready {
            info!(port, attempts, "server ready");
            return Ok(());
        }
        if attempts % 5 == 0 {
            debug!(port, attempts, "server not ready yet");
        }
        std::thread::sleep(interval);
    }
    Err(EvalError::ServerNotReady {
        port,
        waited: timeout,
    })
}

/// Append a newline unless the message already ends with one.
pub fn ensure_newline(msg: &str) -> String {
    if msg.ends_with('\n') {
        msg.to_string()
    } else {
        format!("{msg}\n")
    }
}

/// Write `msg` newline-terminated.
pub fn write_line<W: Write + ?Sized>(w: &mut W, msg: &str) -> std::io::Result<()> {
    w.write_all(ensure_newline(msg).as_bytes())?;
    w.flush()
}

/// One `recv`: read whatever is available (up to `limit` bytes), lossily
/// decoded and trimmed. An orderly close yields an empty string.
pub fn read_chunk<R: Read + ?Sized>(r: &mut R, limit: usize) -> std::io::Result<String> {
    let mut buf = vec![0u8; limit];
    loop {
        match r.read(&mut buf) {
            Ok(n) => return Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_bindable() {
        let port = allocate().unwrap();
        assert_ne!(port, 0);
        let again = TcpListener::bind((Ipv4Addr::LOCALHOST, port));
        assert!(again.is_ok(), "port {port} should be free after release");
    }

    #[test]
    fn sequential_allocations_do_not_fail() {
        for _ in 0..20 {
            allocate().unwrap();
        }
    }

    #[test]
    fn range_allocation_stays_in_range() {
        let port = allocate_in_range(20000, 10).unwrap();
        assert!(port >= 20000);
    }

    #[test]
    fn wait_for_tcp_server_sees_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_server(
            port,
            Protocol::Tcp,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .unwrap();
    }

    #[test]
    fn wait_for_missing_server_times_out() {
        let port = allocate().unwrap();
        let err = wait_for_server(
            port,
            Protocol::Tcp,
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::ServerNotReady { .. }));
    }

    #[test]
    fn wait_for_udp_server_sees_bound_socket() {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = sock.local_addr().unwrap().port();
        wait_for_server(
            port,
            Protocol::Udp,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .unwrap();
    }

    #[test]
    fn newline_is_added_once() {
        assert_eq!(ensure_newline("OK"), "OK\n");
        assert_eq!(ensure_newline("OK\n"), "OK\n");
    }
}
