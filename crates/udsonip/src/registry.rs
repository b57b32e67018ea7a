//! Named peers and scoped, exclusive access to a shared bridge
//!
//! A [`PeerRegistry`] maps peer names to logical addresses on one
//! [`ConnectionBridge`]. [`PeerRegistry::scope`] waits (first come, first
//! served) for exclusive use of the bridge, binds the peer's address, and
//! returns a [`PeerScope`] guard. Leaving the scope, whether by
//! [`PeerScope::release`], early return or unwinding, puts the previous
//! target back and hands the bridge to the next waiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::MutexGuard;
use tracing::{debug, error, info};

use crate::address::LogicalAddress;
use crate::bridge::{ConnectionBridge, ContextId, ScopeOwner};
use crate::codec::{ServiceRequest, ServiceResponse};
use crate::config::PeerConfig;
use crate::error::{Result, UdsOnIpError};

/// A registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    pub address: LogicalAddress,
}

/// Name to address mapping with exclusive-access arbitration
pub struct PeerRegistry {
    bridge: Arc<ConnectionBridge>,
    peers: RwLock<BTreeMap<String, LogicalAddress>>,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &*self.peers.read())
            .field("bridge", &self.bridge)
            .finish()
    }
}

impl PeerRegistry {
    pub fn new(bridge: Arc<ConnectionBridge>) -> Self {
        Self {
            bridge,
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a registry with every configured peer registered
    pub fn from_config(bridge: Arc<ConnectionBridge>, peers: &[PeerConfig]) -> Result<Self> {
        let registry = Self::new(bridge);
        for peer in peers {
            registry.register(peer.name.clone(), peer.address)?;
        }
        Ok(registry)
    }

    pub fn bridge(&self) -> &Arc<ConnectionBridge> {
        &self.bridge
    }

    /// Register `name` at `address`, replacing any earlier mapping of the
    /// same name. Returns the replaced address.
    pub fn register(
        &self,
        name: impl Into<String>,
        address: LogicalAddress,
    ) -> Result<Option<LogicalAddress>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(UdsOnIpError::InvalidPeerName { name });
        }

        let mut peers = self.peers.write();
        if let Some((existing, _)) = peers
            .iter()
            .find(|(other, addr)| **addr == address && **other != name)
        {
            return Err(UdsOnIpError::DuplicateName {
                name,
                existing: existing.clone(),
                address,
            });
        }

        let previous = peers.insert(name.clone(), address);
        match previous {
            Some(old) if old != address => {
                info!(peer = %name, from = %old, to = %address, "Peer re-registered")
            }
            Some(_) => {}
            None => info!(peer = %name, %address, "Peer registered"),
        }
        Ok(previous)
    }

    pub fn remove(&self, name: &str) -> Option<PeerEntry> {
        let address = self.peers.write().remove(name)?;
        debug!(peer = name, %address, "Peer removed");
        Some(PeerEntry {
            name: name.to_string(),
            address,
        })
    }

    pub fn get(&self, name: &str) -> Option<PeerEntry> {
        self.peers.read().get(name).map(|address| PeerEntry {
            name: name.to_string(),
            address: *address,
        })
    }

    pub fn name_of(&self, address: LogicalAddress) -> Option<String> {
        self.peers
            .read()
            .iter()
            .find(|(_, addr)| **addr == address)
            .map(|(name, _)| name.clone())
    }

    /// All peers, sorted by name
    pub fn peers(&self) -> Vec<PeerEntry> {
        self.peers
            .read()
            .iter()
            .map(|(name, address)| PeerEntry {
                name: name.clone(),
                address: *address,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Acquire exclusive use of the bridge for `name`, waiting at most the
    /// configured scope timeout
    pub async fn scope(&self, name: &str) -> Result<PeerScope<'_>> {
        self.scope_with_timeout(name, self.bridge.options().scope_timeout)
            .await
    }

    /// Acquire exclusive use of the bridge for `name`, waiting at most `timeout`
    ///
    /// Fails with `ReentrantAcquisition` if the calling task already holds a
    /// scope on this bridge, and with `AcquireTimeout` if another scope
    /// keeps it past the deadline. If binding the peer's address fails the
    /// bridge is released before the error is returned.
    pub async fn scope_with_timeout(&self, name: &str, timeout: Duration) -> Result<PeerScope<'_>> {
        let address = self
            .get(name)
            .ok_or_else(|| UdsOnIpError::UnknownPeer(name.to_string()))?
            .address;

        let context = ContextId::current();
        if let Some(holder) = self.bridge.holder() {
            if holder.context == context {
                return Err(UdsOnIpError::ReentrantAcquisition {
                    requested: name.to_string(),
                    held: holder.peer,
                });
            }
        }

        let guard = tokio::time::timeout(timeout, self.bridge.access().lock())
            .await
            .map_err(|_| UdsOnIpError::AcquireTimeout {
                name: name.to_string(),
                timeout,
            })?;

        let previous = self.bridge.enter_scope(ScopeOwner {
            context,
            peer: name.to_string(),
        });
        // Dropped before `guard`, so ownership is gone before the lock is
        // handed on, also when this future is cancelled mid-bind
        let mut entry = PendingEntry {
            bridge: &self.bridge,
            bound: false,
        };

        if let Err(e) = self.bridge.bind_target(address).await {
            debug!(peer = name, %address, %e, "Scope entry failed");
            return Err(e);
        }
        entry.bound = true;

        debug!(peer = name, %address, "Scope entered");
        Ok(PeerScope {
            bridge: &self.bridge,
            name: name.to_string(),
            address,
            previous,
            guard: Some(guard),
        })
    }

    /// Close the shared bridge
    pub async fn close(&self) {
        self.bridge.close().await;
    }
}

/// Undoes scope ownership unless the target was bound
struct PendingEntry<'a> {
    bridge: &'a ConnectionBridge,
    bound: bool,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if !self.bound {
            // The target is only replaced once binding succeeds
            self.bridge.abandon_scope();
        }
    }
}

/// Exclusive handle on a bridge bound to one peer
///
/// Dropping the handle restores the target that was bound before the scope
/// was entered and releases the bridge. Use [`PeerScope::release`] to
/// observe a restoration failure instead of only having it logged.
pub struct PeerScope<'a> {
    bridge: &'a ConnectionBridge,
    name: String,
    address: LogicalAddress,
    previous: Option<LogicalAddress>,
    guard: Option<MutexGuard<'a, ()>>,
}

impl PeerScope<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> LogicalAddress {
        self.address
    }

    pub fn bridge(&self) -> &ConnectionBridge {
        self.bridge
    }

    /// Send one request to this peer
    pub async fn request(
        &self,
        request: &ServiceRequest,
        timeout: Duration,
    ) -> Result<ServiceResponse> {
        self.bridge.exchange(request, timeout).await
    }

    /// Leave the scope, reporting a failed restoration as `RestoreFailed`
    ///
    /// The bridge is released either way.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let result = self.bridge.exit_scope(self.previous);
        drop(guard);
        debug!(peer = %self.name, "Scope exited");
        result
    }
}

impl Drop for PeerScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(peer = %self.name, %e, "Target restoration failed on scope exit");
        }
    }
}

impl std::fmt::Debug for PeerScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerScope")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("previous", &self.previous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeOptions, ConnectionState};
    use crate::codec::UdsCodec;
    use crate::transport::mock::{MockEcu, MockGateway};
    use crate::transport::TransportError;

    const ENGINE: LogicalAddress = LogicalAddress::new(0x00E0);
    const TRANSMISSION: LogicalAddress = LogicalAddress::new(0x00E1);

    fn setup() -> (Arc<MockGateway>, PeerRegistry) {
        let gateway = MockGateway::new();
        gateway.add_ecu(ENGINE, MockEcu::new());
        gateway.add_ecu(TRANSMISSION, MockEcu::new());
        let bridge = ConnectionBridge::new(
            gateway.clone(),
            Arc::new(UdsCodec),
            BridgeOptions::default(),
        );
        let registry = PeerRegistry::new(Arc::new(bridge));
        registry.register("engine", ENGINE).unwrap();
        registry.register("transmission", TRANSMISSION).unwrap();
        (gateway, registry)
    }

    fn tester_present() -> ServiceRequest {
        ServiceRequest::new(0x3E, vec![0x00])
    }

    #[test]
    fn test_register_upserts_by_name() {
        let (_, registry) = setup();
        let previous = registry.register("engine", LogicalAddress::new(0x00E2)).unwrap();
        assert_eq!(previous, Some(ENGINE));
        assert_eq!(registry.get("engine").unwrap().address, LogicalAddress::new(0x00E2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_rejects_second_name_for_address() {
        let (_, registry) = setup();
        let err = registry.register("motor", ENGINE).unwrap_err();
        assert!(matches!(
            err,
            UdsOnIpError::DuplicateName { ref existing, .. } if existing == "engine"
        ));
        assert!(matches!(
            registry.register("  ", LogicalAddress::new(0x0010)),
            Err(UdsOnIpError::InvalidPeerName { .. })
        ));
    }

    #[test]
    fn test_lookup_helpers() {
        let (_, registry) = setup();
        assert_eq!(registry.name_of(TRANSMISSION).as_deref(), Some("transmission"));
        let names: Vec<_> = registry.peers().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["engine", "transmission"]);

        assert_eq!(registry.remove("engine").map(|p| p.address), Some(ENGINE));
        assert!(registry.remove("engine").is_none());
        assert!(registry.get("engine").is_none());
    }

    #[tokio::test]
    async fn test_unknown_peer_leaves_state_unchanged() {
        let (_, registry) = setup();
        let err = registry.scope("unknown").await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::UnknownPeer(ref name) if name == "unknown"));
        assert_eq!(registry.bridge().state(), ConnectionState::Idle);
        assert_eq!(registry.bridge().current_target(), None);
    }

    #[tokio::test]
    async fn test_scope_sets_busy_and_restores_previous_target() {
        let (gateway, registry) = setup();
        registry.bridge().retarget(ENGINE).await.unwrap();

        let scope = registry.scope("transmission").await.unwrap();
        assert_eq!(registry.bridge().state(), ConnectionState::Busy);
        assert_eq!(registry.bridge().current_target(), Some(TRANSMISSION));
        scope.request(&tester_present(), Duration::from_millis(100)).await.unwrap();
        scope.release().unwrap();

        assert_eq!(registry.bridge().state(), ConnectionState::Idle);
        assert_eq!(registry.bridge().current_target(), Some(ENGINE));
        assert_eq!(gateway.sent_targets(), vec![TRANSMISSION]);
    }

    #[tokio::test]
    async fn test_first_scope_leaves_target_unset() {
        let (_, registry) = setup();
        {
            let _scope = registry.scope("engine").await.unwrap();
            assert_eq!(registry.bridge().current_target(), Some(ENGINE));
        }
        assert_eq!(registry.bridge().current_target(), None);
        assert_eq!(registry.bridge().state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_nested_scope_fails_fast() {
        let (_, registry) = setup();
        let _engine = registry.scope("engine").await.unwrap();

        let err = registry.scope("transmission").await.unwrap_err();
        assert!(matches!(
            err,
            UdsOnIpError::ReentrantAcquisition { ref requested, ref held }
                if requested == "transmission" && held == "engine"
        ));
        assert_eq!(registry.bridge().current_target(), Some(ENGINE));
    }

    #[test]
    fn test_nested_scope_outside_task_fails_fast() {
        // block_on runs outside any task, so the holder is keyed by thread
        let (_, registry) = setup();
        tokio_test::block_on(async {
            let engine = registry.scope("engine").await.unwrap();
            let err = registry.scope("engine").await.unwrap_err();
            assert!(matches!(err, UdsOnIpError::ReentrantAcquisition { .. }));
            engine.release().unwrap();

            let transmission = registry.scope("transmission").await.unwrap();
            assert_eq!(transmission.address(), TRANSMISSION);
        });
    }

    #[tokio::test]
    async fn test_retarget_refused_while_scope_held() {
        let (_, registry) = setup();
        let _engine = registry.scope("engine").await.unwrap();

        let err = registry.bridge().retarget(TRANSMISSION).await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::TargetLocked(ref peer) if peer == "engine"));
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held_elsewhere() {
        let (_, registry) = setup();
        let registry = Arc::new(registry);
        let _engine = registry.scope("engine").await.unwrap();

        let contender = registry.clone();
        let err = tokio::spawn(async move {
            contender
                .scope_with_timeout("transmission", Duration::from_millis(50))
                .await
                .map(|_| ())
        })
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, UdsOnIpError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn test_rejected_address_releases_bridge() {
        let (_, registry) = setup();
        registry.register("broadcast", LogicalAddress::new(0xE400)).unwrap();

        let err = registry.scope("broadcast").await.unwrap_err();
        assert!(matches!(err, UdsOnIpError::AddressRejected { .. }));
        assert_eq!(registry.bridge().state(), ConnectionState::Idle);
        assert!(registry.bridge().holder().is_none());

        let scope = registry
            .scope_with_timeout("engine", Duration::from_millis(50))
            .await
            .unwrap();
        scope.release().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_scope_entry_leaves_no_owner() {
        let gateway = MockGateway::new();
        gateway.add_ecu(ENGINE, MockEcu::new());
        let options = BridgeOptions {
            auto_reconnect: true,
            ..BridgeOptions::default()
        };
        let bridge = ConnectionBridge::new(gateway.clone(), Arc::new(UdsCodec), options);
        let registry = PeerRegistry::new(Arc::new(bridge));
        registry.register("engine", ENGINE).unwrap();

        registry.bridge().retarget(ENGINE).await.unwrap();
        gateway.fail_next_send(TransportError::SendFailed("cable pulled".into()));
        assert!(registry
            .bridge()
            .request(&tester_present(), Duration::from_millis(50))
            .await
            .is_err());
        assert_eq!(registry.bridge().state(), ConnectionState::Error);

        // Entry is abandoned while the reconnect is still sleeping
        gateway.set_reconnect_delay(Duration::from_millis(200));
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), registry.scope("engine")).await;
        assert!(cancelled.is_err());
        assert!(registry.bridge().holder().is_none());
        assert_eq!(registry.bridge().current_target(), Some(ENGINE));

        gateway.set_reconnect_delay(Duration::ZERO);
        let scope = registry.scope("engine").await.unwrap();
        scope.request(&tester_present(), Duration::from_millis(50)).await.unwrap();
        scope.release().unwrap();
        assert_eq!(gateway.reconnect_calls(), 2);
        assert_eq!(registry.bridge().state(), ConnectionState::Idle);
    }

    #[test]
    fn test_debug_output_names_peers_and_state() {
        let (_, registry) = setup();
        let rendered = format!("{:?}", registry);
        assert!(rendered.contains("engine"));
        assert!(rendered.contains("transmission"));
        assert!(rendered.contains("state: Idle"));
    }

    #[tokio::test]
    async fn test_restore_failure_is_escalated_and_lock_released() {
        let (gateway, registry) = setup();
        registry.bridge().retarget(ENGINE).await.unwrap();

        let scope = registry.scope("transmission").await.unwrap();
        gateway.fail_next_send(TransportError::ConnectionClosed);
        assert!(scope.request(&tester_present(), Duration::from_millis(50)).await.is_err());

        let err = scope.release().unwrap_err();
        assert!(matches!(err, UdsOnIpError::RestoreFailed { address, .. } if address == ENGINE));
        assert_eq!(registry.bridge().current_target(), Some(ENGINE));
        assert_eq!(registry.bridge().state(), ConnectionState::Error);

        // Lock is free: the next scope fails on the connection, not on waiting
        let err = registry
            .scope_with_timeout("engine", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, UdsOnIpError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_closes_shared_bridge() {
        let (gateway, registry) = setup();
        registry.close().await;
        registry.close().await;
        assert_eq!(registry.bridge().state(), ConnectionState::Disconnected);
        assert_eq!(gateway.close_calls(), 1);
    }
}
