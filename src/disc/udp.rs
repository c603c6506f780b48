use crate::{disc::packet::MAX_PACKET_SIZE, types::Node};
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, time::timeout};
use tracing::*;

/// Short-lived UDP socket talking to a single node.
///
/// Datagrams from any other address are dropped. `responded` stays false
/// until the node sends something back.
#[derive(Debug)]
pub struct UdpClient {
    node: Node,
    addr: SocketAddr,
    socket: UdpSocket,
    response_timeout: Duration,
    responded: bool,
}

impl UdpClient {
    /// Binds an ephemeral local port of the node's address family.
    pub async fn bind(node: Node, response_timeout: Duration) -> Result<Self, io::Error> {
        let addr = node
            .udp_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            node,
            addr,
            socket,
            response_timeout,
            responded: false,
        })
    }

    pub const fn node(&self) -> &Node {
        &self.node
    }

    pub const fn responded(&self) -> bool {
        self.responded
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.socket.local_addr()
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), io::Error> {
        self.socket.send_to(data, self.addr).await?;
        Ok(())
    }

    /// Next datagram from the node, or `None` once the response timeout
    /// passes without one.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, io::Error> {
        let mut buf = vec![0_u8; MAX_PACKET_SIZE];
        loop {
            let (len, from) = match timeout(self.response_timeout, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };
            if from != self.addr {
                trace!("dropping datagram from unexpected address {}", from);
                continue;
            }
            self.responded = true;
            buf.truncate(len);
            return Ok(Some(buf));
        }
    }
}
