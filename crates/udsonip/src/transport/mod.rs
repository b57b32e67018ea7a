//! Transport layer for DoIP communication
//!
//! - [`TransportLink`]: the TCP diagnostic connection to a gateway
//! - [`DiscoveryTransport`]: UDP broadcast/listen for vehicle discovery
//! - `doip`: ISO 13400 link over `doip-sockets` (feature `doip`)
//! - `udp`: discovery sockets over tokio UDP
//! - `mock`: in-memory gateway and discovery network for tests
//!
//! # Example
//!
//! ```ignore
//! use udsonip::transport::create_connector;
//! use udsonip::config::TransportConfig;
//!
//! let connector = create_connector(&config.transport)?;
//! let link = connector.connect("192.168.1.10".parse()?).await?;
//! link.send(0x00E0.into(), &[0x3E, 0x00]).await?;
//! ```

pub mod error;
mod link;
pub mod mock;
pub mod udp;

#[cfg(feature = "doip")]
pub mod doip;

pub use error::TransportError;
pub use link::{
    Datagram, DatagramChannel, DiscoveryTransport, IncomingFrame, LinkConnector, TransportLink,
};

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a link connector based on configuration
pub fn create_connector(
    config: &TransportConfig,
) -> Result<Arc<dyn LinkConnector>, TransportError> {
    match config {
        #[cfg(feature = "doip")]
        TransportConfig::DoIp(cfg) => Ok(Arc::new(doip::DoIpConnector::new(cfg.clone()))),
        #[cfg(not(feature = "doip"))]
        TransportConfig::DoIp(_) => Err(TransportError::Unsupported(
            "DoIP requires the 'doip' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockConnector::new(
            mock::MockGateway::from_config(cfg),
        ))),
    }
}
