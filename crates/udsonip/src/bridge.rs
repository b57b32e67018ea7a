//! Connection bridge: one physical link, one switchable logical target
//!
//! The bridge owns the [`TransportLink`] to the gateway and the address
//! that outgoing requests are sent to. Retargeting only rewrites that
//! address; the physical connection stays up. A request is correlated with
//! its reply by the fact that only one target is bound at a time, so the
//! next reply received is attributed to the current target.
//!
//! Exclusive use across tasks is arbitrated by a fair (FIFO) lock held by
//! [`PeerScope`](crate::PeerScope)s and by direct requests while they run.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::address::LogicalAddress;
use crate::codec::{Decoded, ProtocolCodec, ServiceRequest, ServiceResponse, UdsCodec};
use crate::error::{Result, UdsOnIpError};
use crate::transport::{LinkConnector, TransportError, TransportLink};

/// Upper bound for a single request, however many 0x78 replies arrive
const MAX_PENDING_WAIT: Duration = Duration::from_secs(30);

/// Connection state as seen by bridge users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Closed; only an explicit reconnect brings it back
    Disconnected,
    /// Connected, no scope holds the target
    Idle,
    /// A scope currently owns the target
    Busy,
    /// The link failed; operations fail with `NotConnected` until reconnect
    Error,
}

/// Tunables for a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub request_timeout: Duration,
    pub pending_timeout: Duration,
    pub scope_timeout: Duration,
    pub auto_reconnect: bool,
    pub allowed_targets: Option<Vec<LogicalAddress>>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(2000),
            pending_timeout: Duration::from_millis(5000),
            scope_timeout: Duration::from_millis(5000),
            auto_reconnect: false,
            allowed_targets: None,
        }
    }
}

/// Identity of the execution context holding a scope
///
/// Tokio task id inside a task, OS thread id otherwise (e.g. the body of
/// `block_on`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextId {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl ContextId {
    pub(crate) fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeOwner {
    pub(crate) context: ContextId,
    pub(crate) peer: String,
}

struct BridgeInner {
    state: ConnectionState,
    target: Option<LogicalAddress>,
    owner: Option<ScopeOwner>,
}

/// A gateway connection with a runtime-switchable target address
pub struct ConnectionBridge {
    link: Arc<dyn TransportLink>,
    codec: Arc<dyn ProtocolCodec>,
    options: BridgeOptions,
    inner: Mutex<BridgeInner>,
    access: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConnectionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionBridge")
            .field("state", &inner.state)
            .field("target", &inner.target)
            .field("holder", &inner.owner.as_ref().map(|o| o.peer.as_str()))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConnectionBridge {
    /// Wrap an established link; no target is bound yet
    pub fn new(
        link: Arc<dyn TransportLink>,
        codec: Arc<dyn ProtocolCodec>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            link,
            codec,
            options,
            inner: Mutex::new(BridgeInner {
                state: ConnectionState::Idle,
                target: None,
                owner: None,
            }),
            access: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a link to `host` and bind `target`, using the UDS codec
    pub async fn connect(
        connector: &dyn LinkConnector,
        host: IpAddr,
        target: LogicalAddress,
        options: BridgeOptions,
    ) -> Result<Self> {
        let link = connector.connect(host).await?;
        let bridge = Self::new(link, Arc::new(UdsCodec), options);
        bridge.retarget(target).await?;
        info!(%host, %target, "Connection bridge established");
        Ok(bridge)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Address requests are currently sent to
    pub fn current_target(&self) -> Option<LogicalAddress> {
        self.inner.lock().target
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Our own (tester) logical address
    pub fn source_address(&self) -> LogicalAddress {
        self.link.source_address()
    }

    /// Bind subsequent requests to `address`
    ///
    /// Fails with `TargetLocked` while a scope or a direct request holds
    /// the bridge; scopes retarget on entry and restore on exit.
    pub async fn retarget(&self, address: LogicalAddress) -> Result<()> {
        let _access = self
            .access
            .try_lock()
            .map_err(|_| UdsOnIpError::TargetLocked(self.holder_description()))?;
        self.bind_target(address).await
    }

    /// Send one request to the current target and wait for its reply
    pub async fn request(
        &self,
        request: &ServiceRequest,
        timeout: Duration,
    ) -> Result<ServiceResponse> {
        if self.is_held_by(ContextId::current()) {
            return self.exchange(request, timeout).await;
        }

        let started = Instant::now();
        let _access = tokio::time::timeout(timeout, self.access.lock())
            .await
            .map_err(|_| UdsOnIpError::Timeout(timeout))?;
        let remaining = timeout.saturating_sub(started.elapsed());
        self.exchange(request, remaining).await
    }

    /// Re-establish the physical connection
    pub async fn reconnect(&self) -> Result<()> {
        info!("Reconnecting connection bridge");
        match self.link.reconnect().await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.state = if inner.owner.is_some() {
                    ConnectionState::Busy
                } else {
                    ConnectionState::Idle
                };
                Ok(())
            }
            Err(e) => {
                warn!(%e, "Reconnect failed");
                self.inner.lock().state = ConnectionState::Error;
                Err(e.into())
            }
        }
    }

    /// Release the physical connection. Calling it again does nothing.
    pub async fn close(&self) {
        let previous = std::mem::replace(
            &mut self.inner.lock().state,
            ConnectionState::Disconnected,
        );
        if previous == ConnectionState::Disconnected {
            return;
        }

        if let Err(e) = self.link.close().await {
            warn!(%e, "Error while closing link");
        }
        info!("Connection bridge closed");
    }

    // -------------------------------------------------------------------------
    // Scope support
    // -------------------------------------------------------------------------

    pub(crate) fn access(&self) -> &tokio::sync::Mutex<()> {
        &self.access
    }

    pub(crate) fn holder(&self) -> Option<ScopeOwner> {
        self.inner.lock().owner.clone()
    }

    fn is_held_by(&self, context: ContextId) -> bool {
        matches!(&self.inner.lock().owner, Some(owner) if owner.context == context)
    }

    fn holder_description(&self) -> String {
        match &self.inner.lock().owner {
            Some(owner) => owner.peer.clone(),
            None => "request in flight".to_string(),
        }
    }

    /// Mark the bridge as owned; returns the target bound before entry
    pub(crate) fn enter_scope(&self, owner: ScopeOwner) -> Option<LogicalAddress> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Idle {
            inner.state = ConnectionState::Busy;
        }
        inner.owner = Some(owner);
        inner.target
    }

    /// Clear ownership taken by a scope entry that never bound its target
    pub(crate) fn abandon_scope(&self) {
        let mut inner = self.inner.lock();
        inner.owner = None;
        if inner.state == ConnectionState::Busy {
            inner.state = ConnectionState::Idle;
        }
    }

    /// Put `previous` back and clear ownership
    ///
    /// The target is written back unconditionally. If the connection is no
    /// longer usable the rebinding is reported as failed so the caller can
    /// escalate it.
    pub(crate) fn exit_scope(&self, previous: Option<LogicalAddress>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.target = previous;
        inner.owner = None;

        match inner.state {
            ConnectionState::Busy => {
                inner.state = ConnectionState::Idle;
                Ok(())
            }
            ConnectionState::Idle => Ok(()),
            ConnectionState::Error | ConnectionState::Disconnected => match previous {
                Some(address) => Err(UdsOnIpError::RestoreFailed {
                    address,
                    source: Box::new(UdsOnIpError::NotConnected),
                }),
                None => Ok(()),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Internals (caller holds `access`)
    // -------------------------------------------------------------------------

    pub(crate) async fn bind_target(&self, address: LogicalAddress) -> Result<()> {
        self.ensure_connected().await?;
        self.check_address(address)?;

        let previous = self.inner.lock().target.replace(address);
        if previous != Some(address) {
            info!(
                from = ?previous.map(|a| a.to_string()),
                to = %address,
                "Target address switched"
            );
        }
        Ok(())
    }

    pub(crate) async fn exchange(
        &self,
        request: &ServiceRequest,
        timeout: Duration,
    ) -> Result<ServiceResponse> {
        self.ensure_connected().await?;
        let target = self.current_target().ok_or(UdsOnIpError::NoTarget)?;
        let payload = self.codec.encode(request)?;

        self.drain_stale_frames().await;

        debug!(%target, payload = %hex::encode(&payload), "Sending request");
        if let Err(e) = self.link.send(target, &payload).await {
            return Err(self.link_failed(e));
        }

        if !request.expects_response {
            return Ok(ServiceResponse {
                service_id: request.service_id,
                data: Vec::new(),
            });
        }

        let started = Instant::now();
        let hard_deadline = started + MAX_PENDING_WAIT.max(timeout);
        let mut deadline = started + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UdsOnIpError::Timeout(timeout));
            }

            let frame = match self.link.receive(remaining).await {
                Ok(frame) => frame,
                Err(e) if e.is_timeout() => {
                    debug!(%target, ?timeout, "No reply before deadline");
                    return Err(UdsOnIpError::Timeout(timeout));
                }
                Err(e) => return Err(self.link_failed(e)),
            };

            if frame.source != target {
                warn!(
                    %target,
                    source = %frame.source,
                    "Reply from unexpected source, attributing to current target"
                );
            }
            debug!(%target, payload = %hex::encode(&frame.payload), "Received reply");

            match self.codec.decode(request, &frame.payload)? {
                Decoded::Positive(response) => return Ok(response),
                Decoded::Negative { service_id, nrc } => {
                    debug!(%target, %nrc, "Negative response");
                    return Err(UdsOnIpError::NegativeResponse { service_id, nrc });
                }
                Decoded::Pending => {
                    debug!(%target, "Response pending, extending deadline");
                    deadline = (Instant::now() + self.options.pending_timeout).min(hard_deadline);
                }
            }
        }
    }

    /// Discard replies that arrived after an earlier request gave up
    async fn drain_stale_frames(&self) {
        while let Ok(frame) = self.link.receive(Duration::ZERO).await {
            debug!(
                source = %frame.source,
                payload = %hex::encode(&frame.payload),
                "Discarding stale frame"
            );
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Busy => Ok(()),
            ConnectionState::Disconnected => Err(UdsOnIpError::NotConnected),
            ConnectionState::Error => {
                if !self.options.auto_reconnect {
                    return Err(UdsOnIpError::NotConnected);
                }
                self.reconnect()
                    .await
                    .map_err(|_| UdsOnIpError::NotConnected)
            }
        }
    }

    fn check_address(&self, address: LogicalAddress) -> Result<()> {
        let reason = if address == LogicalAddress::RESERVED {
            Some("reserved address".to_string())
        } else if address == self.link.source_address() {
            Some("tester's own source address".to_string())
        } else if address.is_functional() {
            Some("functional addresses cannot be bound as a target".to_string())
        } else if matches!(&self.options.allowed_targets, Some(allowed) if !allowed.contains(&address))
        {
            Some("not in allowed targets".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(UdsOnIpError::AddressRejected { address, reason }),
            None => Ok(()),
        }
    }

    fn link_failed(&self, err: TransportError) -> UdsOnIpError {
        error!(%err, "Link failure, bridge needs reconnect");
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Disconnected {
            inner.state = ConnectionState::Error;
        }
        UdsOnIpError::Transport(err)
    }
}
