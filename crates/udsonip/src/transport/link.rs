//! Transport seams consumed by the bridge and by discovery

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use doip_definitions::payload::DoipPayload;

use super::TransportError;
use crate::address::LogicalAddress;

/// Diagnostic frame received from the gateway
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    /// Logical address of the ECU that sent the frame
    pub source: LogicalAddress,
    /// Raw UDS payload
    pub payload: Vec<u8>,
    pub timestamp: Instant,
}

impl IncomingFrame {
    pub fn new(source: LogicalAddress, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            timestamp: Instant::now(),
        }
    }
}

/// Established point-to-point connection to a diagnostic gateway
///
/// One link carries traffic for every ECU behind the gateway; the target
/// address travels with each frame, so switching ECUs never touches the
/// physical connection.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Send one diagnostic payload to `target`
    async fn send(&self, target: LogicalAddress, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next diagnostic frame
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrives in time.
    async fn receive(&self, timeout: Duration) -> Result<IncomingFrame, TransportError>;

    async fn is_connected(&self) -> bool;

    /// Re-establish the physical connection
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Release the physical connection
    async fn close(&self) -> Result<(), TransportError>;

    /// Our own (tester) logical address
    fn source_address(&self) -> LogicalAddress;
}

/// Opens links to a gateway host
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self, host: IpAddr) -> Result<Arc<dyn TransportLink>, TransportError>;
}

/// One datagram read from a discovery socket
pub enum Datagram {
    /// Decoded DoIP message
    Message { source: IpAddr, payload: DoipPayload },
    /// Bytes the DoIP codec rejected; the sender is not always known
    Undecodable {
        source: Option<IpAddr>,
        reason: String,
    },
}

/// A datagram socket opened for one discovery run
///
/// Dropping the channel releases the underlying socket.
#[async_trait]
pub trait DatagramChannel: Send {
    /// Send to the destination the channel was opened for
    async fn send(&mut self, payload: DoipPayload) -> Result<(), TransportError>;

    /// Wait for the next datagram (no timeout; callers bound the wait)
    async fn recv(&mut self) -> Result<Datagram, TransportError>;
}

/// Out-of-band broadcast primitives used by discovery
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Socket that sends identification requests to `destination` and
    /// receives the directed responses
    async fn open_probe(
        &self,
        destination: SocketAddr,
    ) -> Result<Box<dyn DatagramChannel>, TransportError>;

    /// Socket bound to `port` that collects unsolicited announcements
    async fn open_listener(&self, port: u16) -> Result<Box<dyn DatagramChannel>, TransportError>;
}
