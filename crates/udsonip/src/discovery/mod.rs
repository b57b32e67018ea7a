//! DoIP entity discovery
//!
//! A discovery run sends one vehicle identification request and, at the
//! same time, listens on the discovery port for unsolicited vehicle
//! announcements. Both activities feed one accumulator keyed by
//! `(source_ip, logical_address)` in which the first record seen for a key
//! wins. When the window closes both sockets are dropped and the records
//! are returned sorted by logical address, then source IP.
//!
//! [`DiscoveryEngine::scan`] sweeps an IPv4 network with directed requests
//! instead of a broadcast.

pub mod frame;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::LogicalAddress;
use crate::bridge::{BridgeOptions, ConnectionBridge};
use crate::config::DiscoveryConfig;
use crate::error::{Result, UdsOnIpError};
use crate::transport::udp::UdpDiscoveryTransport;
use crate::transport::{Datagram, DatagramChannel, DiscoveryTransport, LinkConnector};
use frame::{Announcement, FrameError, ProbeFilter};

/// How a record reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    /// Directed reply to our identification request
    ProbeResponse,
    /// Spontaneous vehicle announcement
    Announcement,
}

/// One DoIP entity found on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub source_ip: IpAddr,
    pub logical_address: LogicalAddress,
    pub vin: [u8; 17],
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action: u8,
    pub sync_status: Option<u8>,
    pub origin: RecordOrigin,
}

impl DiscoveryRecord {
    pub fn new(source_ip: IpAddr, announcement: Announcement, origin: RecordOrigin) -> Self {
        Self {
            source_ip,
            logical_address: announcement.logical_address,
            vin: announcement.vin,
            eid: announcement.eid,
            gid: announcement.gid,
            further_action: announcement.further_action,
            sync_status: announcement.sync_status,
            origin,
        }
    }

    pub fn vin_string(&self) -> String {
        String::from_utf8_lossy(&self.vin)
            .trim_matches(char::from(0))
            .to_string()
    }

    pub fn eid_hex(&self) -> String {
        hex::encode_upper(self.eid)
    }

    pub fn gid_hex(&self) -> String {
        hex::encode_upper(self.gid)
    }

    /// Entity asks for routing activation before diagnostics (further action 0x10)
    pub fn routing_activation_required(&self) -> bool {
        self.further_action == 0x10
    }

    /// Open a new bridge to this entity, targeted at its logical address
    pub async fn connect(
        &self,
        connector: &dyn LinkConnector,
        options: BridgeOptions,
    ) -> Result<ConnectionBridge> {
        ConnectionBridge::connect(connector, self.source_ip, self.logical_address, options).await
    }

    fn key(&self) -> (IpAddr, LogicalAddress) {
        (self.source_ip, self.logical_address)
    }
}

impl std::fmt::Display for DiscoveryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.source_ip, self.logical_address)
    }
}

/// Deduplicated, sorted result of one discovery run
///
/// Records are ordered by logical address, then by source IP. IP ties are
/// broken numerically (IPv4 octet by octet, IPv4 before IPv6), so
/// `10.0.0.9` sorts before `10.0.0.30` even though it is the larger string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySnapshot {
    records: Vec<DiscoveryRecord>,
}

impl DiscoverySnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiscoveryRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[DiscoveryRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DiscoveryRecord> {
        self.records
    }

    /// First record (lowest source IP) for `address`
    pub fn find(&self, address: LogicalAddress) -> Option<&DiscoveryRecord> {
        self.records.iter().find(|r| r.logical_address == address)
    }
}

impl IntoIterator for DiscoverySnapshot {
    type Item = DiscoveryRecord;
    type IntoIter = std::vec::IntoIter<DiscoveryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a DiscoverySnapshot {
    type Item = &'a DiscoveryRecord;
    type IntoIter = std::slice::Iter<'a, DiscoveryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Default)]
struct Accumulator {
    seen: HashSet<(IpAddr, LogicalAddress)>,
    records: Vec<DiscoveryRecord>,
}

impl Accumulator {
    fn insert(&mut self, record: DiscoveryRecord) {
        if !self.seen.insert(record.key()) {
            debug!(%record, origin = ?record.origin, "Duplicate discovery record ignored");
            return;
        }
        debug!(%record, origin = ?record.origin, vin = %record.vin_string(), "Entity discovered");
        self.records.push(record);
    }

    fn into_snapshot(self) -> DiscoverySnapshot {
        let mut records = self.records;
        records.sort_by_key(|r| (r.logical_address, r.source_ip));
        DiscoverySnapshot { records }
    }
}

/// Hosts probed concurrently by [`DiscoveryEngine::scan`]
const SCAN_BATCH: usize = 64;
/// Widest network [`DiscoveryEngine::scan`] accepts
const MIN_SCAN_PREFIX: u32 = 16;

/// Host addresses of an IPv4 network in CIDR notation
///
/// Network and broadcast addresses are skipped except for /31 and /32.
fn scan_hosts(network: &str) -> Result<Vec<Ipv4Addr>> {
    let invalid = |reason: &str| UdsOnIpError::Config(format!("scan network '{}': {}", network, reason));

    let (base, prefix) = network
        .split_once('/')
        .ok_or_else(|| invalid("expected a.b.c.d/prefix"))?;
    let base: Ipv4Addr = base.trim().parse().map_err(|_| invalid("bad IPv4 address"))?;
    let prefix: u32 = prefix.trim().parse().map_err(|_| invalid("bad prefix length"))?;
    if prefix > 32 {
        return Err(invalid("prefix longer than 32"));
    }
    if prefix < MIN_SCAN_PREFIX {
        return Err(invalid("network too large to scan"));
    }

    let mask = u32::MAX << (32 - prefix);
    let first = u32::from(base) & mask;
    let last = first | !mask;
    let hosts = if prefix >= 31 {
        first..=last
    } else {
        first + 1..=last - 1
    };
    Ok(hosts.map(Ipv4Addr::from).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Listening,
    Closed,
}

/// Moves the engine to `Closed` however the run ends
struct ListeningGuard<'a>(&'a Mutex<DiscoveryState>);

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = DiscoveryState::Closed;
    }
}

/// Runs discovery over a [`DiscoveryTransport`]
pub struct DiscoveryEngine {
    transport: Arc<dyn DiscoveryTransport>,
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
}

impl DiscoveryEngine {
    pub fn new(transport: Arc<dyn DiscoveryTransport>, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(DiscoveryState::Idle),
        }
    }

    /// Engine over real UDP sockets on all interfaces
    pub fn udp(config: DiscoveryConfig) -> Self {
        Self::new(Arc::new(UdpDiscoveryTransport::new()), config)
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Discover with the configured window
    pub async fn discover(&self) -> Result<DiscoverySnapshot> {
        self.discover_with_timeout(Duration::from_millis(self.config.timeout_ms))
            .await
    }

    /// Probe and listen for `timeout`, then return what was collected
    ///
    /// No responses is an empty snapshot, not an error. Malformed frames are
    /// logged and dropped.
    pub async fn discover_with_timeout(&self, timeout: Duration) -> Result<DiscoverySnapshot> {
        let _closing = self.begin_run()?;

        let filter = self.probe_filter()?;
        let destination = self.broadcast_destination()?;
        let deadline = Instant::now() + timeout;

        let mut probe = self.transport.open_probe(destination).await?;
        let mut listener = if self.config.listen_announcements {
            Some(self.transport.open_listener(self.config.port).await?)
        } else {
            None
        };

        probe.send(filter.to_payload()).await?;
        info!(%destination, ?timeout, "Vehicle identification request sent");

        let accumulator = Mutex::new(Accumulator::default());
        let probe_activity = collect(
            probe.as_mut(),
            RecordOrigin::ProbeResponse,
            &accumulator,
            deadline,
        );
        let listen_activity = async {
            if let Some(listener) = listener.as_mut() {
                collect(
                    listener.as_mut(),
                    RecordOrigin::Announcement,
                    &accumulator,
                    deadline,
                )
                .await;
            }
        };
        tokio::join!(probe_activity, listen_activity);

        drop(probe);
        drop(listener);

        let snapshot = accumulator.into_inner().into_snapshot();
        info!(count = snapshot.len(), "Discovery complete");
        Ok(snapshot)
    }

    /// Ask the entity at `ip` to identify itself
    ///
    /// Returns `None` when it does not answer within `timeout`.
    pub async fn identify(&self, ip: IpAddr, timeout: Duration) -> Result<Option<DiscoveryRecord>> {
        let destination = SocketAddr::new(ip, self.config.port);
        let deadline = Instant::now() + timeout;

        let mut channel = self.transport.open_probe(destination).await?;
        channel.send(ProbeFilter::Any.to_payload()).await?;
        debug!(%destination, "Directed identification request sent");

        loop {
            let datagram = match tokio::time::timeout_at(deadline, channel.recv()).await {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            match datagram {
                Datagram::Message { source, payload } if source == ip => {
                    match Announcement::from_payload(payload) {
                        Ok(announcement) => {
                            return Ok(Some(DiscoveryRecord::new(
                                ip,
                                announcement,
                                RecordOrigin::ProbeResponse,
                            )))
                        }
                        Err(e) => log_rejected(Some(source), &e),
                    }
                }
                Datagram::Message { source, .. } => {
                    debug!(%source, %ip, "Ignoring reply from other entity")
                }
                Datagram::Undecodable { source, reason } => {
                    log_rejected(source, &FrameError::Undecodable(reason))
                }
            }
        }
    }

    /// Send a directed identification request to every host of `network`
    /// (IPv4 CIDR, at most a /16)
    ///
    /// Hosts are probed in batches, each batch waiting `per_host` for
    /// answers. Records are merged and ordered as in a discovery run.
    pub async fn scan(&self, network: &str, per_host: Duration) -> Result<DiscoverySnapshot> {
        let hosts = scan_hosts(network)?;
        let _closing = self.begin_run()?;
        info!(network, hosts = hosts.len(), ?per_host, "Scanning for DoIP entities");

        let accumulator = Arc::new(Mutex::new(Accumulator::default()));
        for batch in hosts.chunks(SCAN_BATCH) {
            let deadline = Instant::now() + per_host;
            let mut pending = JoinSet::new();
            for host in batch {
                let destination = SocketAddr::new(IpAddr::V4(*host), self.config.port);
                let mut channel = self.transport.open_probe(destination).await?;
                channel.send(ProbeFilter::Any.to_payload()).await?;

                let accumulator = accumulator.clone();
                pending.spawn(async move {
                    collect(
                        channel.as_mut(),
                        RecordOrigin::ProbeResponse,
                        &accumulator,
                        deadline,
                    )
                    .await;
                });
            }
            while pending.join_next().await.is_some() {}
        }

        let snapshot = std::mem::take(&mut *accumulator.lock()).into_snapshot();
        info!(network, count = snapshot.len(), "Scan complete");
        Ok(snapshot)
    }

    /// Enter `Listening`, refusing to overlap with a running discovery
    fn begin_run(&self) -> Result<ListeningGuard<'_>> {
        let mut state = self.state.lock();
        if *state == DiscoveryState::Listening {
            return Err(UdsOnIpError::DiscoveryInProgress);
        }
        *state = DiscoveryState::Listening;
        Ok(ListeningGuard(&self.state))
    }

    fn probe_filter(&self) -> Result<ProbeFilter> {
        match (&self.config.vin, &self.config.eid) {
            (Some(_), Some(_)) => Err(UdsOnIpError::Config(
                "discovery vin and eid filters are mutually exclusive".to_string(),
            )),
            (Some(vin), None) => {
                let vin: [u8; 17] = vin.as_bytes().try_into().map_err(|_| {
                    UdsOnIpError::Config(format!("VIN '{}' must be 17 characters", vin))
                })?;
                Ok(ProbeFilter::Vin(vin))
            }
            (None, Some(eid)) => {
                let bytes = hex::decode(eid)
                    .map_err(|e| UdsOnIpError::Config(format!("EID '{}': {}", eid, e)))?;
                let eid: [u8; 6] = bytes.try_into().map_err(|_| {
                    UdsOnIpError::Config(format!("EID '{}' must be 6 bytes", eid))
                })?;
                Ok(ProbeFilter::Eid(eid))
            }
            (None, None) => Ok(ProbeFilter::Any),
        }
    }

    fn broadcast_destination(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.broadcast_address.parse().map_err(|e| {
            UdsOnIpError::Config(format!(
                "broadcast address '{}': {}",
                self.config.broadcast_address, e
            ))
        })?;
        Ok(SocketAddr::new(ip, self.config.port))
    }
}

/// Receive on `channel` until `deadline`, feeding parsed records into `accumulator`
async fn collect(
    channel: &mut dyn DatagramChannel,
    origin: RecordOrigin,
    accumulator: &Mutex<Accumulator>,
    deadline: Instant,
) {
    loop {
        let datagram = match tokio::time::timeout_at(deadline, channel.recv()).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!(%e, ?origin, "Discovery receive failed, keeping records gathered so far");
                break;
            }
            Ok(Ok(datagram)) => datagram,
        };

        match datagram {
            Datagram::Message { source, payload } => match Announcement::from_payload(payload) {
                Ok(announcement) => {
                    accumulator
                        .lock()
                        .insert(DiscoveryRecord::new(source, announcement, origin));
                }
                Err(e) => log_rejected(Some(source), &e),
            },
            Datagram::Undecodable { source, reason } => {
                log_rejected(source, &FrameError::Undecodable(reason))
            }
        }
    }
}

fn log_rejected(source: Option<IpAddr>, err: &FrameError) {
    match err {
        // Our own probe loops back to the listener on broadcast
        FrameError::NotAnnouncement => debug!(?source, %err, "Ignoring discovery message"),
        FrameError::Undecodable(_) => warn!(?source, %err, "Dropping malformed discovery frame"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::transport::mock::MockDiscoveryTransport;
    use crate::transport::TransportError;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn announcement(address: u16, further_action: u8) -> Announcement {
        Announcement {
            vin: *b"WVWZZZ3CZWE123456",
            logical_address: LogicalAddress::new(address),
            eid: [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E],
            gid: [0; 6],
            further_action,
            sync_status: None,
        }
    }

    fn engine(network: &MockDiscoveryTransport, config: DiscoveryConfig) -> DiscoveryEngine {
        DiscoveryEngine::new(Arc::new(network.clone()), config)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let network = MockDiscoveryTransport::new();
        let engine = engine(&network, DiscoveryConfig::default());
        assert_eq!(engine.state(), DiscoveryState::Idle);

        let snapshot = engine.discover_with_timeout(Duration::from_millis(20)).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(engine.state(), DiscoveryState::Closed);

        // A closed engine can run again
        engine.discover_with_timeout(Duration::from_millis(20)).await.unwrap();
        assert_eq!(engine.state(), DiscoveryState::Closed);
    }

    #[tokio::test]
    async fn test_request_uses_filter_and_broadcast_address() {
        let network = MockDiscoveryTransport::new();
        let config = DiscoveryConfig {
            vin: Some("WVWZZZ3CZWE123456".to_string()),
            ..DiscoveryConfig::default()
        };
        engine(&network, config)
            .discover_with_timeout(Duration::from_millis(10))
            .await
            .unwrap();

        let requests = network.sent_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "255.255.255.255:13400".parse::<SocketAddr>().unwrap());
        assert_eq!(requests[0].1, ProbeFilter::Vin(*b"WVWZZZ3CZWE123456"));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_config_error() {
        let network = MockDiscoveryTransport::new();
        let config = DiscoveryConfig {
            eid: Some("zz".to_string()),
            ..DiscoveryConfig::default()
        };
        let engine = engine(&network, config);
        let err = engine.discover_with_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::Config(_)));
        assert_eq!(engine.state(), DiscoveryState::Closed);
        assert_eq!(network.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_listener_open_failure_releases_request_socket() {
        let network = MockDiscoveryTransport::new();
        network.fail_next_listener(TransportError::Bind {
            addr: "0.0.0.0:13400".to_string(),
            reason: "address in use".to_string(),
        });
        let engine = engine(&network, DiscoveryConfig::default());

        let err = engine.discover_with_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::Transport(TransportError::Bind { .. })));
        assert_eq!(network.open_channels(), 0);
        assert_eq!(engine.state(), DiscoveryState::Closed);
    }

    #[tokio::test]
    async fn test_passive_collection_can_be_disabled() {
        let network = MockDiscoveryTransport::new();
        network.add_announcement(ip(20), Duration::from_millis(5), announcement(0x2000, 0));
        network.add_responder(ip(10), Duration::from_millis(5), announcement(0x1000, 0));
        let config = DiscoveryConfig {
            listen_announcements: false,
            ..DiscoveryConfig::default()
        };

        let snapshot = engine(&network, config)
            .discover_with_timeout(Duration::from_millis(60))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0].origin, RecordOrigin::ProbeResponse);
    }

    #[tokio::test]
    async fn test_identify_directed_request() {
        let network = MockDiscoveryTransport::new();
        network.add_responder(ip(10), Duration::from_millis(5), announcement(0x1010, 0x10));
        network.add_responder(ip(11), Duration::from_millis(5), announcement(0x1011, 0x00));
        let engine = engine(&network, DiscoveryConfig::default());

        let record = engine
            .identify(ip(10), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.logical_address, LogicalAddress::new(0x1010));
        assert!(record.routing_activation_required());
        assert_eq!(record.vin_string(), "WVWZZZ3CZWE123456");
        assert_eq!(record.eid_hex(), "001A2B3C4D5E");

        assert!(engine
            .identify(ip(99), Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());
        assert_eq!(engine.state(), DiscoveryState::Idle);
    }

    #[test]
    fn test_ip_ties_sort_numerically() {
        let mut accumulator = Accumulator::default();
        for last in [30, 9, 100] {
            accumulator.insert(DiscoveryRecord::new(
                ip(last),
                announcement(0x1000, 0),
                RecordOrigin::Announcement,
            ));
        }
        let order: Vec<IpAddr> = accumulator
            .into_snapshot()
            .records()
            .iter()
            .map(|r| r.source_ip)
            .collect();
        assert_eq!(order, vec![ip(9), ip(30), ip(100)]);
    }

    #[test]
    fn test_scan_hosts() {
        let hosts = scan_hosts("10.0.0.0/29").unwrap();
        assert_eq!(hosts.len(), 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[5], Ipv4Addr::new(10, 0, 0, 6));

        // Host bits in the base address are ignored
        assert_eq!(scan_hosts("10.0.0.77/30").unwrap(), vec![
            Ipv4Addr::new(10, 0, 0, 77),
            Ipv4Addr::new(10, 0, 0, 78),
        ]);
        assert_eq!(scan_hosts("10.0.0.7/32").unwrap(), vec![Ipv4Addr::new(10, 0, 0, 7)]);
        assert_eq!(scan_hosts("10.0.0.6/31").unwrap().len(), 2);

        for bad in ["10.0.0.0", "10.0.0/24", "10.0.0.0/33", "10.0.0.0/8", "10.0.0.0/x"] {
            assert!(
                matches!(scan_hosts(bad), Err(UdsOnIpError::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_scan_sends_one_request_per_host() {
        let network = MockDiscoveryTransport::new();
        let host = |last| IpAddr::V4(Ipv4Addr::new(10, 0, 0, last));
        network.add_responder(host(5), Duration::from_millis(5), announcement(0x2000, 0));
        network.add_responder(host(2), Duration::from_millis(5), announcement(0x1000, 0x10));
        // Outside the scanned network
        network.add_responder(host(9), Duration::from_millis(5), announcement(0x3000, 0));
        let engine = engine(&network, DiscoveryConfig::default());

        let snapshot = engine.scan("10.0.0.0/29", Duration::from_millis(60)).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records()[0].source_ip, host(2));
        assert_eq!(snapshot.records()[1].source_ip, host(5));
        assert!(snapshot
            .records()
            .iter()
            .all(|r| r.origin == RecordOrigin::ProbeResponse));

        let requests = network.sent_requests();
        assert_eq!(requests.len(), 6);
        assert!(requests.iter().all(|(_, filter)| *filter == ProbeFilter::Any));
        assert!(requests
            .iter()
            .all(|(destination, _)| destination.port() == 13400));
        assert_eq!(network.open_channels(), 0);
        assert_eq!(engine.state(), DiscoveryState::Closed);
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_network() {
        let network = MockDiscoveryTransport::new();
        let engine = engine(&network, DiscoveryConfig::default());
        let err = engine.scan("not-a-network", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::Config(_)));
        assert!(network.sent_requests().is_empty());
        assert_eq!(engine.state(), DiscoveryState::Idle);
    }
}
