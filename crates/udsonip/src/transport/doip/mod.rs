//! DoIP (Diagnostics over IP) link per ISO 13400-2
//!
//! Uses the `doip-definitions` and `doip-sockets` crates for the TCP data
//! channel to a gateway:
//!
//! - Connect with timeout and retry
//! - Routing activation handshake
//! - Diagnostic messages to any target address behind the gateway
//! - Alive check answering and optional keep-alive
//! - Explicit reconnect
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! type = "doip"
//! host = "192.168.1.10"
//! port = 13400
//! source_address = 0x0E00
//! ```

mod link;

pub use link::{DoIpConnector, DoIpLink};
