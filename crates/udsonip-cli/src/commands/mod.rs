//! Command implementations for the udsonip CLI

pub mod diag;
pub mod discover;
pub mod peers;

pub use diag::{read, session, tester_present};
pub use discover::{discover, identify, scan};
pub use peers::peers;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context, Result};
use udsonip::{
    create_connector, BridgeOptions, ConnectionBridge, PeerRegistry, TransportConfig, UdsCodec,
    UdsOnIpConfig,
};

/// Connect to the configured gateway and register the configured peers
pub async fn open_registry(config: &UdsOnIpConfig, gateway: Option<IpAddr>) -> Result<PeerRegistry> {
    let host = match (&config.transport, gateway) {
        (_, Some(ip)) => ip,
        (TransportConfig::DoIp(gw), None) => gw
            .host
            .parse()
            .with_context(|| format!("Invalid gateway address: {}", gw.host))?,
        (TransportConfig::Mock(_), None) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };

    let connector = create_connector(&config.transport).context("Failed to create transport")?;
    let link = connector
        .connect(host)
        .await
        .with_context(|| format!("Failed to connect to gateway {}", host))?;
    tracing::debug!(%host, "Gateway link established");

    let bridge = ConnectionBridge::new(link, Arc::new(UdsCodec), BridgeOptions::from(&config.bridge));
    PeerRegistry::from_config(Arc::new(bridge), &config.peers).context("Invalid peer configuration")
}

/// Parse a hex number with optional `0x` prefix
pub(crate) fn parse_hex<T>(value: &str, what: &str) -> Result<T>
where
    T: TryFrom<u32>,
{
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let number = u32::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid {}: {}", what, value))?;
    T::try_from(number).map_err(|_| anyhow::anyhow!("{} out of range: {}", what, value))
}
