//! OS-level port availability checks.
//!
//! A positive answer is advisory only: nothing stops another process from
//! binding the port right after the probe returns. Callers re-probe leases on
//! reuse and consumers are expected to retry their own bind on failure.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default bound for the connect half of a probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Answers "can `port` be bound on `host` right now?".
///
/// The allocator only talks to the OS through this trait, which lets callers
/// plug in a different notion of availability (tests use a scripted probe).
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16, host: &str) -> bool;
}

/// Probe backed by real sockets.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProbe for TcpProber {
    fn is_available(&self, port: u16, host: &str) -> bool {
        probe(port, host, self.timeout)
    }
}

/// Check whether `port` can currently be bound on `host`, using the default
/// probe timeout.
pub fn is_port_available(port: u16, host: &str) -> bool {
    probe(port, host, DEFAULT_PROBE_TIMEOUT)
}

fn probe(port: u16, host: &str, timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }

    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::debug!("Cannot resolve probe host '{}': {}", host, e);
            return false;
        }
    };
    if addrs.is_empty() {
        return false;
    }

    for addr in &addrs {
        if let Err(e) = bind_exclusive(*addr) {
            tracing::trace!("Port {} not bindable on {}: {}", port, addr, e);
            return false;
        }
    }

    // On macOS, binding 127.0.0.1 can succeed while 0.0.0.0 is held, so a
    // loopback probe also checks the wildcard address of the same family.
    if addrs.iter().any(|a| a.ip().is_loopback()) {
        let wildcard: IpAddr = if addrs.iter().any(|a| a.is_ipv4()) {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        };
        if bind_exclusive(SocketAddr::new(wildcard, port)).is_err() {
            tracing::trace!("Port {} held on wildcard address", port);
            return false;
        }
    }

    // A listener on a more specific interface would not block our bind on some
    // platforms but will still accept connections.
    for addr in addrs.iter().filter(|a| !a.ip().is_unspecified()) {
        if TcpStream::connect_timeout(addr, timeout).is_ok() {
            tracing::trace!("Port {} accepted a connection on {}", port, addr);
            return false;
        }
    }

    true
}

/// Bind-and-drop a socket without `SO_REUSEADDR`.
///
/// `TcpListener::bind` sets that flag on Unix, which lets the bind succeed
/// next to another socket that is bound with the flag but not yet listening.
fn bind_exclusive(addr: SocketAddr) -> io::Result<()> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(false)?;
    socket.bind(&addr.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn bound_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_available(port, "127.0.0.1"));
        drop(listener);
    }

    #[test]
    fn released_port_is_available() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(is_port_available(port, "127.0.0.1"));
    }

    #[test]
    fn port_zero_is_never_available() {
        assert!(!is_port_available(0, "127.0.0.1"));
    }

    #[test]
    fn wildcard_listener_blocks_loopback_probe() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!TcpProber::default().is_available(port, "127.0.0.1"));
        drop(listener);
    }

    #[test]
    fn bound_but_not_listening_socket_blocks_probe() {
        let holder = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        holder.set_reuse_address(true).unwrap();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        holder.bind(&any.into()).unwrap();
        let port = holder
            .local_addr()
            .unwrap()
            .as_socket()
            .unwrap()
            .port();

        assert!(!is_port_available(port, "127.0.0.1"));
        drop(holder);
        assert!(is_port_available(port, "127.0.0.1"));
    }
}
