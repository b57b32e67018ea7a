//! Configuration
//!
//! TOML configuration for the gateway link, the bridge, discovery and the
//! named peers. Logical addresses may be written as TOML hex integers.
//!
//! ```toml
//! [transport]
//! type = "doip"
//! host = "192.168.1.10"
//! source_address = 0x0E00
//!
//! [bridge]
//! request_timeout_ms = 2000
//! auto_reconnect = true
//!
//! [[peers]]
//! name = "engine"
//! address = 0x00E0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::LogicalAddress;
use crate::bridge::BridgeOptions;
use crate::error::{Result, UdsOnIpError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdsOnIpConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl UdsOnIpConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| UdsOnIpError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| UdsOnIpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// DoIP (Diagnostics over IP) - ISO 13400
    DoIp(GatewayConfig),
    /// In-memory gateway for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// DoIP gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway IP address
    pub host: String,
    /// Gateway TCP port
    #[serde(default = "default_doip_port")]
    pub port: u16,
    /// Tester logical address
    #[serde(default = "default_source_address")]
    pub source_address: LogicalAddress,
    /// Routing activation type (0x00 default, 0x01 WWH-OBD)
    #[serde(default)]
    pub activation_type: u8,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_ms: u64,
    /// Alive check interval in seconds (0 to disable)
    #[serde(default)]
    pub keepalive_interval_secs: u64,
}

impl GatewayConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_doip_port(),
            source_address: default_source_address(),
            activation_type: 0,
            connect_timeout_ms: default_connect_timeout(),
            activation_timeout_ms: default_activation_timeout(),
            keepalive_interval_secs: 0,
        }
    }
}

fn default_doip_port() -> u16 {
    13400
}

fn default_source_address() -> LogicalAddress {
    LogicalAddress::DEFAULT_TESTER
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_activation_timeout() -> u64 {
    2000
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// ECUs answering behind the mock gateway
    #[serde(default)]
    pub ecus: Vec<LogicalAddress>,
}

// =============================================================================
// Bridge Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Default per-request reply timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Extra wait granted per response-pending (NRC 0x78) reply
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_ms: u64,
    /// Default wait for exclusive access in `scope`
    #[serde(default = "default_scope_timeout")]
    pub scope_timeout_ms: u64,
    /// Retry the connection once when an operation finds it failed
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Only these targets may be selected (all unicast targets when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_targets: Option<Vec<LogicalAddress>>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            pending_timeout_ms: default_pending_timeout(),
            scope_timeout_ms: default_scope_timeout(),
            auto_reconnect: false,
            allowed_targets: None,
        }
    }
}

impl From<&BridgeConfig> for BridgeOptions {
    fn from(config: &BridgeConfig) -> Self {
        BridgeOptions {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            pending_timeout: Duration::from_millis(config.pending_timeout_ms),
            scope_timeout: Duration::from_millis(config.scope_timeout_ms),
            auto_reconnect: config.auto_reconnect,
            allowed_targets: config.allowed_targets.clone(),
        }
    }
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_pending_timeout() -> u64 {
    5000
}

fn default_scope_timeout() -> u64 {
    5000
}

// =============================================================================
// Discovery Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP discovery port
    #[serde(default = "default_doip_port")]
    pub port: u16,
    /// Destination of the identification request
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Discovery window in milliseconds
    #[serde(default = "default_discovery_timeout")]
    pub timeout_ms: u64,
    /// Collect unsolicited vehicle announcements alongside the probe
    #[serde(default = "default_true")]
    pub listen_announcements: bool,
    /// Only ask the entity with this VIN to respond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    /// Only ask the entity with this EID (12 hex digits) to respond
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_doip_port(),
            broadcast_address: default_broadcast_address(),
            timeout_ms: default_discovery_timeout(),
            listen_announcements: true,
            vin: None,
            eid: None,
        }
    }
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_discovery_timeout() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Peers
// =============================================================================

/// A named ECU behind the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub address: LogicalAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = UdsOnIpConfig::from_toml_str("").unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
        assert_eq!(config.bridge.request_timeout_ms, 2000);
        assert_eq!(config.discovery.port, 13400);
        assert!(config.discovery.listen_announcements);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_doip_config_with_hex_addresses() {
        let config = UdsOnIpConfig::from_toml_str(
            r#"
            [transport]
            type = "doip"
            host = "192.168.1.10"
            source_address = 0x0E80

            [bridge]
            auto_reconnect = true
            allowed_targets = [0x00E0, 0x00E1]

            [[peers]]
            name = "engine"
            address = 0x00E0
            "#,
        )
        .unwrap();

        let TransportConfig::DoIp(gateway) = &config.transport else {
            panic!("expected doip transport, got {:?}", config.transport);
        };
        assert_eq!(gateway.port, 13400);
        assert_eq!(gateway.source_address, LogicalAddress::new(0x0E80));

        let options = BridgeOptions::from(&config.bridge);
        assert!(options.auto_reconnect);
        assert_eq!(options.request_timeout, Duration::from_millis(2000));
        assert_eq!(
            options.allowed_targets,
            Some(vec![LogicalAddress::new(0x00E0), LogicalAddress::new(0x00E1)])
        );
        assert_eq!(config.peers[0].address, LogicalAddress::new(0x00E0));
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let err = UdsOnIpConfig::from_toml_str("[transport]\ntype = \"carrier-pigeon\"").unwrap_err();
        assert!(matches!(err, UdsOnIpError::Config(_)));
    }
}
