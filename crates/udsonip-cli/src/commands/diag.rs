//! Diagnostic commands run inside a peer scope

use anyhow::{Context, Result};
use udsonip::{DiagnosticServices, PeerRegistry};

use super::parse_hex;
use crate::output::OutputContext;

/// Read a data identifier
pub async fn read(registry: &PeerRegistry, peer: &str, did: &str, ctx: &OutputContext) -> Result<()> {
    let did: u16 = parse_hex(did, "DID")?;
    let scope = registry
        .scope(peer)
        .await
        .with_context(|| format!("Cannot access peer '{}'", peer))?;

    let value = scope
        .read_data_by_identifier(did)
        .await
        .with_context(|| format!("ReadDataByIdentifier 0x{:04X} on '{}' failed", did, peer))?;
    scope.release()?;

    if ctx.quiet {
        println!("{}", hex::encode_upper(&value));
        return Ok(());
    }

    let printable = value.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
    if printable && !value.is_empty() {
        println!("0x{:04X}: {} ({})", did, hex::encode_upper(&value), String::from_utf8_lossy(&value));
    } else {
        println!("0x{:04X}: {}", did, hex::encode_upper(&value));
    }
    Ok(())
}

pub async fn tester_present(registry: &PeerRegistry, peer: &str, ctx: &OutputContext) -> Result<()> {
    let scope = registry
        .scope(peer)
        .await
        .with_context(|| format!("Cannot access peer '{}'", peer))?;
    scope
        .tester_present(false)
        .await
        .with_context(|| format!("TesterPresent to '{}' failed", peer))?;
    scope.release()?;

    ctx.success(&format!("{} is present", peer));
    Ok(())
}

/// Change diagnostic session
pub async fn session(registry: &PeerRegistry, peer: &str, session: &str, ctx: &OutputContext) -> Result<()> {
    let (id, name) = match session.to_lowercase().as_str() {
        "default" => (0x01, "Default"),
        "programming" => (0x02, "Programming"),
        "extended" => (0x03, "Extended"),
        other => (parse_hex::<u8>(other, "session")?, "Custom"),
    };

    let scope = registry
        .scope(peer)
        .await
        .with_context(|| format!("Cannot access peer '{}'", peer))?;
    let params = scope
        .diagnostic_session_control(id)
        .await
        .with_context(|| format!("DiagnosticSessionControl on '{}' failed", peer))?;
    scope.release()?;

    ctx.success(&format!("{} session changed to {} (0x{:02X})", peer, name, id));
    if !params.is_empty() {
        ctx.info(&format!("Session parameters: {}", hex::encode_upper(&params)));
    }
    Ok(())
}
