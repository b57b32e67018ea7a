//! UDP sockets for DoIP vehicle discovery

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use doip_definitions::payload::DoipPayload;
use doip_sockets::udp::UdpSocket as DoIpUdpSocket;
use tracing::debug;

use super::{Datagram, DatagramChannel, DiscoveryTransport, TransportError};

/// Discovery over real UDP sockets
///
/// Probes go out from an ephemeral port; the announcement listener binds
/// the DoIP discovery port. Both sockets frame and decode messages with
/// the DoIP codec.
#[derive(Debug, Clone)]
pub struct UdpDiscoveryTransport {
    bind_ip: IpAddr,
}

impl UdpDiscoveryTransport {
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Bind probes and listeners to a specific local interface address
    pub fn with_bind_ip(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    async fn bind(&self, port: u16) -> Result<DoIpUdpSocket, TransportError> {
        let addr = SocketAddr::new(self.bind_ip, port).to_string();
        DoIpUdpSocket::bind(addr.as_str())
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })
    }
}

impl Default for UdpDiscoveryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct UdpChannel {
    socket: DoIpUdpSocket,
    destination: Option<SocketAddr>,
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&mut self, payload: DoipPayload) -> Result<(), TransportError> {
        let destination = self
            .destination
            .ok_or_else(|| TransportError::SendFailed("listener cannot send".to_string()))?;
        self.socket
            .send(payload, destination)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        debug!(%destination, "Discovery message sent");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Datagram, TransportError> {
        match self.socket.recv().await {
            Some(Ok((msg, from))) => Ok(Datagram::Message {
                source: from.ip(),
                payload: msg.payload,
            }),
            Some(Err(e)) => Ok(Datagram::Undecodable {
                source: None,
                reason: e.to_string(),
            }),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl DiscoveryTransport for UdpDiscoveryTransport {
    async fn open_probe(
        &self,
        destination: SocketAddr,
    ) -> Result<Box<dyn DatagramChannel>, TransportError> {
        let socket = self.bind(0).await?;
        Ok(Box::new(UdpChannel {
            socket,
            destination: Some(destination),
        }))
    }

    async fn open_listener(&self, port: u16) -> Result<Box<dyn DatagramChannel>, TransportError> {
        let socket = self.bind(port).await?;
        Ok(Box::new(UdpChannel {
            socket,
            destination: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::frame::ProbeFilter;

    #[tokio::test]
    async fn test_sends_identification_request() {
        let transport = UdpDiscoveryTransport::with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let mut probe = transport.open_probe(responder_addr).await.unwrap();
        probe.send(ProbeFilter::Any.to_payload()).await.unwrap();

        // Generic header only: version, inverse version, type 0x0001, length 0
        let mut buf = [0u8; 64];
        let (len, _) = responder.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 8);
        assert_eq!(buf[0], !buf[1]);
        assert_eq!(&buf[2..8], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_listener_cannot_send() {
        let transport = UdpDiscoveryTransport::with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut listener = transport.open_listener(0).await.unwrap();
        let err = listener.send(ProbeFilter::Any.to_payload()).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }
}
