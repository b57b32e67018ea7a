//! udsonip - Multi-ECU UDS over DoIP
//!
//! This crate bridges a DoIP gateway connection with the UDS request/response
//! protocol and adds what the transport does not provide on its own:
//! retargeting one physical connection across several ECU logical addresses,
//! exclusive scoped access to named ECUs from concurrent tasks, and
//! vehicle/entity discovery by broadcast probe and passive announcements.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PeerRegistry                          │
//! │   name -> LogicalAddress        scope(name) -> PeerScope     │
//! │                          │                                   │
//! │                ┌─────────┴──────────┐                        │
//! │                │  ConnectionBridge  │  current target, state │
//! │                │  (fair busy lock)  │                        │
//! │                └──┬──────────────┬──┘                        │
//! │                   │              │                           │
//! │          ┌────────┴──────┐ ┌─────┴──────────┐                │
//! │          │ TransportLink │ │ ProtocolCodec  │                │
//! │          │ (DoIP / mock) │ │ (UDS)          │                │
//! │          └───────────────┘ └────────────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//!
//!   DiscoveryEngine ── DiscoveryTransport (UDP / mock)
//!        └── DiscoveryRecord::connect() -> ConnectionBridge
//! ```
//!
//! # Example
//!
//! ```ignore
//! use udsonip::{ConnectionBridge, PeerRegistry, DiagnosticServices};
//!
//! let registry = PeerRegistry::new(Arc::new(bridge));
//! registry.register("engine", 0x00E0.into())?;
//! registry.register("transmission", 0x00E1.into())?;
//!
//! let engine = registry.scope("engine").await?;
//! let vin = engine.read_data_by_identifier(0xF190).await?;
//! engine.release()?;
//! ```

pub mod address;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod services;
pub mod transport;

pub use address::LogicalAddress;
pub use bridge::{BridgeOptions, ConnectionBridge, ConnectionState};
pub use codec::{
    CodecError, Decoded, NegativeResponseCode, ProtocolCodec, ServiceRequest, ServiceResponse,
    UdsCodec,
};
pub use config::{
    BridgeConfig, DiscoveryConfig, GatewayConfig, PeerConfig, TransportConfig, UdsOnIpConfig,
};
pub use discovery::{
    DiscoveryEngine, DiscoveryRecord, DiscoverySnapshot, DiscoveryState, RecordOrigin,
};
pub use error::{Result, UdsOnIpError};
pub use registry::{PeerEntry, PeerRegistry, PeerScope};
pub use services::{DiagnosticServices, Requester};
pub use transport::{
    create_connector, Datagram, DatagramChannel, DiscoveryTransport, IncomingFrame,
    LinkConnector, TransportError, TransportLink,
};
