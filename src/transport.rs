// src/transport.rs
//! Transport contracts between the agent core and its collaborators.
//!
//! Candidate gathering, TCP/UDP multiplexing and mDNS resolution live
//! outside the agent; these traits pin down exactly what the core needs from
//! them. The only concrete implementation provided here is the plain UDP
//! socket wrapper the integration tests (and simple deployments) use.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::candidate::{Candidate, NetworkType};
use crate::error::IceResult;

/// A packet-oriented transport handle exclusively owned by one candidate.
///
/// `send_to` must not block: implementations queue or drop when the socket
/// is not writable, and the agent treats a failed probe write as a lost
/// packet.
pub trait CandidateConn: Send + Sync {
    /// Address the handle is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Write one frame towards `target` without blocking
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Release the underlying socket. Called at most once per candidate.
    fn close(&self) -> io::Result<()>;
}

impl fmt::Debug for dyn CandidateConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "CandidateConn({})", addr),
            Err(_) => write!(f, "CandidateConn(closed)"),
        }
    }
}

/// TCP multiplexer contract: the agent only ever asks it to drop the
/// demultiplexing entry for a local ufrag (on restart, close and failure).
pub trait TcpMux: Send + Sync {
    fn remove_conn_by_ufrag(&self, ufrag: &str);
}

/// UDP multiplexer contract, same shape as [`TcpMux`].
pub trait UdpMux: Send + Sync {
    fn remove_conn_by_ufrag(&self, ufrag: &str);
}

/// Server-reflexive UDP multiplexer contract.
pub trait UniversalUdpMux: Send + Sync {
    fn remove_conn_by_ufrag(&self, ufrag: &str);
}

/// mDNS resolution collaborator. Resolution blocks on network I/O, so it is
/// always driven from outside the event loop.
pub trait MdnsResolver: Send + Sync {
    /// Resolve a `.local` hostname to an IP address
    fn resolve<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, IceResult<IpAddr>>;

    /// Shut the resolver down
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Host networking contract used for active-TCP candidate synthesis.
pub trait Net: Send + Sync {
    /// Local interface IPs eligible for the given network type, after the
    /// configured interface/IP filters
    fn local_ips(&self, network: NetworkType) -> io::Result<Vec<IpAddr>>;

    /// Create an active TCP connection handle from `local_ip` towards a
    /// remote passive candidate. The returned handle may connect lazily.
    fn dial_active_tcp(
        &self,
        local_ip: IpAddr,
        remote: SocketAddr,
    ) -> io::Result<Arc<dyn CandidateConn>>;
}

/// [`CandidateConn`] over a plain UDP socket.
pub struct UdpConn {
    socket: Arc<UdpSocket>,
}

impl UdpConn {
    /// Bind a new UDP socket
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl CandidateConn for UdpConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(data, target)
    }

    fn close(&self) -> io::Result<()> {
        // Dropping the last Arc closes the socket; the reader task observes
        // the agent shutting down instead.
        Ok(())
    }
}

/// Spawn a reader task that feeds inbound frames from a UDP socket into the
/// agent, demultiplexing on behalf of `local`. The task ends when the agent
/// closes or the socket errors.
pub fn spawn_udp_reader(
    agent: Arc<Agent>,
    local: Arc<Candidate>,
    socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let mut done = agent.done_signal();

        loop {
            tokio::select! {
                _ = done.changed() => break,
                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((n, from)) => {
                        agent.handle_read(&local, &buf[..n], from).await;
                    }
                    Err(err) => {
                        warn!("UDP reader for {} stopped: {}", local, err);
                        break;
                    }
                },
            }
        }

        debug!("UDP reader for {} finished", local);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_conn_send_receive() {
        let a = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send_to(b"ping", b_addr).unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, from) = b.socket().recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_conn_close() {
        let conn = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(conn.close().is_ok());
    }
}
