//! Peers command - list configured peers

use anyhow::Result;
use udsonip::{PeerEntry, UdsOnIpConfig};

use crate::output::{peer_table, OutputContext};

pub fn peers(config: &UdsOnIpConfig, ctx: &OutputContext) -> Result<()> {
    if config.peers.is_empty() {
        ctx.info("No peers configured");
        return Ok(());
    }

    let mut peers: Vec<PeerEntry> = config
        .peers
        .iter()
        .map(|p| PeerEntry {
            name: p.name.clone(),
            address: p.address,
        })
        .collect();
    peers.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}", peer_table(&peers));
    Ok(())
}
