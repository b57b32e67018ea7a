//! Output formatting for the udsonip CLI

use colored::Colorize;
use serde_json::json;
use tabled::{Table, Tabled};
use udsonip::{DiscoveryRecord, DiscoverySnapshot, PeerEntry, RecordOrigin};

/// Context for output rendering
pub struct OutputContext {
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }
}

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "VIN")]
    vin: String,
    #[tabled(rename = "EID")]
    eid: String,
    #[tabled(rename = "Activation")]
    activation: String,
    #[tabled(rename = "Seen via")]
    origin: String,
}

fn origin_name(origin: RecordOrigin) -> &'static str {
    match origin {
        RecordOrigin::ProbeResponse => "probe",
        RecordOrigin::Announcement => "announcement",
    }
}

impl From<&DiscoveryRecord> for EntityRow {
    fn from(record: &DiscoveryRecord) -> Self {
        Self {
            ip: record.source_ip.to_string(),
            address: record.logical_address.to_string(),
            vin: record.vin_string(),
            eid: record.eid_hex(),
            activation: if record.routing_activation_required() {
                "required".to_string()
            } else {
                "-".to_string()
            },
            origin: origin_name(record.origin).to_string(),
        }
    }
}

pub fn entity_table(records: &[DiscoveryRecord]) -> String {
    let rows: Vec<EntityRow> = records.iter().map(EntityRow::from).collect();
    Table::new(rows).to_string()
}

pub fn record_json(record: &DiscoveryRecord) -> serde_json::Value {
    json!({
        "ip": record.source_ip.to_string(),
        "logical_address": record.logical_address.value(),
        "vin": record.vin_string(),
        "eid": record.eid_hex(),
        "gid": record.gid_hex(),
        "further_action": record.further_action,
        "sync_status": record.sync_status,
        "origin": origin_name(record.origin),
    })
}

pub fn snapshot_json(snapshot: &DiscoverySnapshot) -> serde_json::Value {
    serde_json::Value::Array(snapshot.iter().map(record_json).collect())
}

#[derive(Tabled)]
struct PeerRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Address")]
    address: String,
}

pub fn peer_table(peers: &[PeerEntry]) -> String {
    let rows: Vec<PeerRow> = peers
        .iter()
        .map(|p| PeerRow {
            name: p.name.clone(),
            address: p.address.to_string(),
        })
        .collect();
    Table::new(rows).to_string()
}
