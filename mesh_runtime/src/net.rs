//! TCP transport connection/dialer and UDP discovery broadcast, over real
//! sockets.

use mesh_core::service::Broadcast;
use mesh_core::transport::{Connection, Dialer};
use mesh_core::types::NodeId;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// A `TcpStream` wearing the `Connection` trait.
#[derive(Debug)]
pub struct TcpConnection(TcpStream);

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        TcpConnection(stream)
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl Connection for TcpConnection {
    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.0.set_read_timeout(Some(timeout))?;
        self.0.set_write_timeout(Some(timeout))
    }
}

/// Resolves a node ID to an address and dials it over TCP.
#[derive(Debug)]
pub struct TcpDialer {
    addresses: HashMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addresses: HashMap<NodeId, SocketAddr>, connect_timeout: Duration) -> Self {
        TcpDialer { addresses, connect_timeout }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, node: NodeId) -> Option<Box<dyn Connection>> {
        let addr = *self.addresses.get(&node)?;
        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(stream) => Some(Box::new(TcpConnection::new(stream))),
            Err(e) => {
                log::debug!("dial to node {node} ({addr}) failed: {e}");
                None
            }
        }
    }
}

/// The discovery UDP broadcast channel: sends to every configured broadcast
/// address on the discovery port, receives inbound datagrams on a bound
/// socket.
#[derive(Debug)]
pub struct UdpBroadcast {
    socket: UdpSocket,
    broadcast_addrs: Vec<SocketAddr>,
}

impl UdpBroadcast {
    /// Binds a broadcast-capable UDP socket on `bind_addr:port` and targets
    /// `broadcast_addrs` (the three wireless-subnet broadcast addresses
    /// outside testing mode, `10.0.0.255` alone inside it).
    pub fn bind(bind_addr: IpAddr, port: u16, broadcast_addrs: Vec<SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((bind_addr, port))?;
        socket.set_broadcast(true)?;
        Ok(UdpBroadcast { socket, broadcast_addrs })
    }

    /// The three wireless-subnet broadcast addresses from the original
    /// deployment, narrowed to the single reachable subnet in testing mode.
    pub fn default_broadcast_addrs(testing_mode: bool, port: u16) -> Vec<SocketAddr> {
        let mut addrs = vec![SocketAddr::new("10.0.0.255".parse().unwrap(), port)];
        if !testing_mode {
            addrs.push(SocketAddr::new("10.0.1.255".parse().unwrap(), port));
            addrs.push(SocketAddr::new("10.0.2.255".parse().unwrap(), port));
        }
        addrs
    }
}

impl Broadcast for UdpBroadcast {
    fn send(&self, payload: &[u8]) {
        for addr in &self.broadcast_addrs {
            if let Err(e) = self.socket.send_to(payload, addr) {
                log::warn!("discovery broadcast to {addr} failed: {e}");
            }
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        self.socket.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0u8; 4096];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => Some((buf[..n].to_vec(), from)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => {
                log::warn!("discovery recv failed: {e}");
                None
            }
        }
    }

    fn reply_to(&self, to: SocketAddr, payload: &[u8]) {
        if let Err(e) = self.socket.send_to(payload, to) {
            log::warn!("discovery reply to {to} failed: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_broadcast_addrs_narrows_in_testing_mode() {
        assert_eq!(UdpBroadcast::default_broadcast_addrs(true, 6500).len(), 1);
        assert_eq!(UdpBroadcast::default_broadcast_addrs(false, 6500).len(), 3);
    }

    #[test]
    fn two_bound_sockets_exchange_a_datagram() {
        let a = UdpBroadcast::bind("127.0.0.1".parse().unwrap(), 0, vec![]).unwrap();
        let a_addr = a.socket.local_addr().unwrap();
        let b = UdpBroadcast::bind("127.0.0.1".parse().unwrap(), 0, vec![a_addr]).unwrap();

        b.send(b"hello");
        let (bytes, _) = a.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(bytes, b"hello");
    }
}
