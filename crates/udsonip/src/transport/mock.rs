//! In-memory gateway and discovery network for testing

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doip_definitions::payload::DoipPayload;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    Datagram, DatagramChannel, DiscoveryTransport, IncomingFrame, LinkConnector, TransportError,
    TransportLink,
};
use crate::address::LogicalAddress;
use crate::config::MockConfig;
use crate::discovery::frame::{Announcement, ProbeFilter};

/// A frame the tester sent through the mock gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub target: LogicalAddress,
    pub payload: Vec<u8>,
}

/// Simulated ECU behind the mock gateway
#[derive(Debug, Clone, Default)]
pub struct MockEcu {
    /// request prefix -> reply frames, sent in order
    responses: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
    /// Never answers
    silent: bool,
}

impl MockEcu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Answer requests starting with `request` with one `response` frame
    pub fn respond(mut self, request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        self.responses.push((request.into(), vec![response.into()]));
        self
    }

    /// Answer with several frames (e.g. response pending followed by the result)
    pub fn respond_with_frames(mut self, request: impl Into<Vec<u8>>, frames: Vec<Vec<u8>>) -> Self {
        self.responses.push((request.into(), frames));
        self
    }

    fn replies_to(&self, request: &[u8]) -> Vec<Vec<u8>> {
        if self.silent {
            return Vec::new();
        }

        if let Some((_, frames)) = self.responses.iter().find(|(req, _)| req == request) {
            return frames.clone();
        }
        if let Some((_, frames)) = self
            .responses
            .iter()
            .find(|(req, _)| request.starts_with(req))
        {
            return frames.clone();
        }

        // Positive response = service_id + 0x40
        match request.first() {
            Some(&sid) => vec![vec![sid.wrapping_add(0x40)]],
            None => Vec::new(),
        }
    }
}

#[derive(Default)]
struct GatewayState {
    ecus: HashMap<LogicalAddress, MockEcu>,
    sent: Vec<SentFrame>,
    fail_next_send: Option<TransportError>,
    reconnect_fails: bool,
    reconnect_delay: Duration,
}

/// Mock DoIP gateway implementing [`TransportLink`]
///
/// Each registered ECU answers frames addressed to it; every send is logged
/// with its target address so tests can check where traffic went.
pub struct MockGateway {
    source_address: LogicalAddress,
    latency: Duration,
    connected: AtomicBool,
    close_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
    state: Mutex<GatewayState>,
    incoming_tx: mpsc::UnboundedSender<IncomingFrame>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingFrame>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            source_address: LogicalAddress::DEFAULT_TESTER,
            latency,
            connected: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
            reconnect_calls: AtomicUsize::new(0),
            state: Mutex::new(GatewayState::default()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    pub fn from_config(config: &MockConfig) -> Arc<Self> {
        let gateway = Self::with_latency(Duration::from_millis(config.latency_ms));
        for address in &config.ecus {
            gateway.add_ecu(*address, MockEcu::new());
        }
        gateway
    }

    /// Register (or replace) the ECU answering at `address`
    pub fn add_ecu(&self, address: LogicalAddress, ecu: MockEcu) {
        self.state.lock().ecus.insert(address, ecu);
    }

    /// Push an unsolicited frame into the receive queue
    pub fn inject(&self, source: LogicalAddress, payload: Vec<u8>) {
        let _ = self.incoming_tx.send(IncomingFrame::new(source, payload));
    }

    /// Every frame sent so far, in order
    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().sent.clone()
    }

    /// Targets of every frame sent so far, in order
    pub fn sent_targets(&self) -> Vec<LogicalAddress> {
        self.state.lock().sent.iter().map(|f| f.target).collect()
    }

    /// Fail the next send with `error`
    pub fn fail_next_send(&self, error: TransportError) {
        self.state.lock().fail_next_send = Some(error);
    }

    pub fn set_reconnect_fails(&self, fails: bool) {
        self.state.lock().reconnect_fails = fails;
    }

    /// Make every reconnect take `delay` before it completes
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.state.lock().reconnect_delay = delay;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    fn deliver(&self, source: LogicalAddress, frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }

        if self.latency.is_zero() {
            for payload in frames {
                let _ = self.incoming_tx.send(IncomingFrame::new(source, payload));
            }
            return;
        }

        let tx = self.incoming_tx.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            for payload in frames {
                tokio::time::sleep(latency).await;
                let _ = tx.send(IncomingFrame::new(source, payload));
            }
        });
    }
}

#[async_trait]
impl TransportLink for MockGateway {
    async fn send(&self, target: LogicalAddress, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let replies = {
            let mut state = self.state.lock();
            if let Some(err) = state.fail_next_send.take() {
                return Err(err);
            }
            state.sent.push(SentFrame {
                target,
                payload: payload.to_vec(),
            });
            match state.ecus.get(&target) {
                Some(ecu) => ecu.replies_to(payload),
                None => {
                    tracing::debug!(%target, "Mock gateway: no ECU at target, dropping");
                    Vec::new()
                }
            }
        };

        tracing::debug!(%target, payload = %hex::encode(payload), "Mock gateway: frame sent");
        self.deliver(target, replies);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<IncomingFrame, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut rx = self.incoming_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().reconnect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.lock().reconnect_fails {
            return Err(TransportError::connect("mock-gateway", "reconnect refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn source_address(&self) -> LogicalAddress {
        self.source_address
    }
}

/// Connector handing out one shared [`MockGateway`]
pub struct MockConnector {
    gateway: Arc<MockGateway>,
    hosts: Mutex<Vec<IpAddr>>,
}

impl MockConnector {
    pub fn new(gateway: Arc<MockGateway>) -> Self {
        Self {
            gateway,
            hosts: Mutex::new(Vec::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<MockGateway> {
        &self.gateway
    }

    /// Hosts passed to `connect`, in order
    pub fn connected_hosts(&self) -> Vec<IpAddr> {
        self.hosts.lock().clone()
    }
}

#[async_trait]
impl LinkConnector for MockConnector {
    async fn connect(&self, host: IpAddr) -> Result<Arc<dyn TransportLink>, TransportError> {
        self.hosts.lock().push(host);
        self.gateway.set_connected(true);
        Ok(self.gateway.clone())
    }
}

// =============================================================================
// Discovery
// =============================================================================

#[derive(Debug, Clone)]
enum MockFrame {
    Announcement(Announcement),
    Undecodable(String),
}

#[derive(Debug, Clone)]
struct ScheduledDatagram {
    delay: Duration,
    source: IpAddr,
    frame: MockFrame,
}

#[derive(Default)]
struct NetworkState {
    /// Replies sent to any probe that reaches `source`
    responders: Vec<ScheduledDatagram>,
    /// Emitted on every listener, timed from when it opens
    announcements: Vec<ScheduledDatagram>,
    requests: Vec<(SocketAddr, ProbeFilter)>,
    fail_open: Option<TransportError>,
    fail_listener: Option<TransportError>,
}

/// Scripted UDP network implementing [`DiscoveryTransport`]
#[derive(Clone, Default)]
pub struct MockDiscoveryTransport {
    state: Arc<Mutex<NetworkState>>,
    open_channels: Arc<AtomicUsize>,
}

impl MockDiscoveryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity at `source` answers each probe after `delay`
    pub fn add_responder(&self, source: IpAddr, delay: Duration, announcement: Announcement) {
        self.state.lock().responders.push(ScheduledDatagram {
            delay,
            source,
            frame: MockFrame::Announcement(announcement),
        });
    }

    /// Entity at `source` announces itself `delay` after a listener opens
    pub fn add_announcement(&self, source: IpAddr, delay: Duration, announcement: Announcement) {
        self.state.lock().announcements.push(ScheduledDatagram {
            delay,
            source,
            frame: MockFrame::Announcement(announcement),
        });
    }

    /// Garbage from `source` reaches every listener `delay` after it opens
    pub fn add_undecodable(&self, source: IpAddr, delay: Duration, reason: impl Into<String>) {
        self.state.lock().announcements.push(ScheduledDatagram {
            delay,
            source,
            frame: MockFrame::Undecodable(reason.into()),
        });
    }

    /// Fail the next `open_probe`/`open_listener` call
    pub fn fail_next_open(&self, error: TransportError) {
        self.state.lock().fail_open = Some(error);
    }

    /// Fail the next `open_listener` call only (e.g. discovery port in use)
    pub fn fail_next_listener(&self, error: TransportError) {
        self.state.lock().fail_listener = Some(error);
    }

    /// Identification requests sent so far with their destinations
    pub fn sent_requests(&self) -> Vec<(SocketAddr, ProbeFilter)> {
        self.state.lock().requests.clone()
    }

    /// Channels currently open (not yet dropped)
    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    fn open(&self, destination: Option<SocketAddr>) -> Result<MockChannel, TransportError> {
        if let Some(err) = self.state.lock().fail_open.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            destination,
            network: self.clone(),
            tx,
            rx,
        })
    }
}

fn schedule(tx: &mpsc::UnboundedSender<Datagram>, datagram: ScheduledDatagram) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(datagram.delay).await;
        let datagram = match datagram.frame {
            MockFrame::Announcement(announcement) => Datagram::Message {
                source: datagram.source,
                payload: announcement.to_payload(),
            },
            MockFrame::Undecodable(reason) => Datagram::Undecodable {
                source: Some(datagram.source),
                reason,
            },
        };
        let _ = tx.send(datagram);
    });
}

struct MockChannel {
    /// `None` for listeners
    destination: Option<SocketAddr>,
    network: MockDiscoveryTransport,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: mpsc::UnboundedReceiver<Datagram>,
}

#[async_trait]
impl DatagramChannel for MockChannel {
    async fn send(&mut self, payload: DoipPayload) -> Result<(), TransportError> {
        let destination = self
            .destination
            .ok_or_else(|| TransportError::SendFailed("listener cannot send".to_string()))?;
        let filter = ProbeFilter::from_payload(&payload).ok_or_else(|| {
            TransportError::SendFailed("mock network only carries identification requests".to_string())
        })?;

        let reached: Vec<ScheduledDatagram> = {
            let mut state = self.network.state.lock();
            state.requests.push((destination, filter));
            let broadcast = match destination.ip() {
                IpAddr::V4(ip) => ip.is_broadcast(),
                IpAddr::V6(_) => false,
            };
            state
                .responders
                .iter()
                .filter(|r| broadcast || r.source == destination.ip())
                .cloned()
                .collect()
        };

        for datagram in reached {
            schedule(&self.tx, datagram);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Datagram, TransportError> {
        // `self.tx` keeps the channel open, so this only ends with a datagram
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.network.open_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryTransport for MockDiscoveryTransport {
    async fn open_probe(
        &self,
        destination: SocketAddr,
    ) -> Result<Box<dyn DatagramChannel>, TransportError> {
        Ok(Box::new(self.open(Some(destination))?))
    }

    async fn open_listener(&self, port: u16) -> Result<Box<dyn DatagramChannel>, TransportError> {
        if let Some(err) = self.state.lock().fail_listener.take() {
            return Err(err);
        }
        let channel = self.open(None)?;
        tracing::debug!(port, "Mock discovery listener opened");
        let announcements = self.state.lock().announcements.clone();
        for datagram in announcements {
            schedule(&channel.tx, datagram);
        }
        Ok(Box::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_routes_by_target() {
        let gateway = MockGateway::new();
        gateway.add_ecu(
            LogicalAddress::new(0x00E0),
            MockEcu::new().respond(vec![0x22, 0xF1, 0x90], vec![0x62, 0xF1, 0x90, 0x41]),
        );
        gateway.add_ecu(LogicalAddress::new(0x00E1), MockEcu::silent());

        gateway.send(LogicalAddress::new(0x00E0), &[0x22, 0xF1, 0x90]).await.unwrap();
        let frame = gateway.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(frame.source, LogicalAddress::new(0x00E0));
        assert_eq!(frame.payload, vec![0x62, 0xF1, 0x90, 0x41]);

        gateway.send(LogicalAddress::new(0x00E1), &[0x3E, 0x00]).await.unwrap();
        let err = gateway.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());

        assert_eq!(
            gateway.sent_targets(),
            vec![LogicalAddress::new(0x00E0), LogicalAddress::new(0x00E1)]
        );
    }

    #[tokio::test]
    async fn test_default_positive_response() {
        let gateway = MockGateway::new();
        gateway.add_ecu(LogicalAddress::new(0x0010), MockEcu::new());

        gateway.send(LogicalAddress::new(0x0010), &[0x10, 0x03]).await.unwrap();
        let frame = gateway.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(frame.payload, vec![0x50]);
    }

    #[tokio::test]
    async fn test_closed_gateway_rejects_io() {
        let gateway = MockGateway::new();
        gateway.close().await.unwrap();
        assert!(matches!(
            gateway.send(LogicalAddress::new(0x0010), &[0x3E, 0x00]).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(gateway.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_channel_counter_tracks_drops() {
        let network = MockDiscoveryTransport::new();
        let listener = network.open_listener(13400).await.unwrap();
        assert_eq!(network.open_channels(), 1);
        drop(listener);
        assert_eq!(network.open_channels(), 0);
    }
}
