//! Discover and identify commands

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use udsonip::{DiscoveryEngine, UdsOnIpConfig};

use crate::output::{entity_table, record_json, snapshot_json, OutputContext};

/// Broadcast a vehicle identification request and collect announcements
pub async fn discover(
    config: &UdsOnIpConfig,
    timeout_ms: Option<u64>,
    json: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let engine = DiscoveryEngine::udp(config.discovery.clone());
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.discovery.timeout_ms));

    if !json {
        ctx.info(&format!("Discovering DoIP entities for {} ms...", timeout.as_millis()));
    }
    let snapshot = engine
        .discover_with_timeout(timeout)
        .await
        .context("Discovery failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot_json(&snapshot))?);
        return Ok(());
    }

    if snapshot.is_empty() {
        ctx.info("No DoIP entities found");
        return Ok(());
    }
    println!("{}", entity_table(snapshot.records()));
    ctx.success(&format!("Found {} entities", snapshot.len()));
    Ok(())
}

/// Sweep an IPv4 network with directed identification requests
pub async fn scan(
    config: &UdsOnIpConfig,
    network: &str,
    timeout_ms: u64,
    json: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let engine = DiscoveryEngine::udp(config.discovery.clone());
    if !json {
        ctx.info(&format!("Scanning {}...", network));
    }
    let snapshot = engine
        .scan(network, Duration::from_millis(timeout_ms))
        .await
        .with_context(|| format!("Scan of {} failed", network))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot_json(&snapshot))?);
    } else if snapshot.is_empty() {
        ctx.info(&format!("No DoIP entities answered in {}", network));
    } else {
        println!("{}", entity_table(snapshot.records()));
        ctx.success(&format!("Found {} entities", snapshot.len()));
    }
    Ok(())
}

/// Send a directed identification request to one entity
pub async fn identify(
    config: &UdsOnIpConfig,
    ip: IpAddr,
    timeout_ms: u64,
    ctx: &OutputContext,
) -> Result<()> {
    let engine = DiscoveryEngine::udp(config.discovery.clone());
    let record = engine
        .identify(ip, Duration::from_millis(timeout_ms))
        .await
        .with_context(|| format!("Identification of {} failed", ip))?;

    match record {
        Some(record) if ctx.quiet => {
            println!("{}", serde_json::to_string(&record_json(&record))?);
        }
        Some(record) => {
            println!("{}", entity_table(std::slice::from_ref(&record)));
        }
        None => ctx.info(&format!("{} did not answer within {} ms", ip, timeout_ms)),
    }
    Ok(())
}
