//! Symmetric response routing (RFC 3581)
//!
//! Peers behind NAT advertise a private `sent-by` in their Via; responses are
//! sent back to the packet source instead, and the top Via is stamped with
//! `received`/`rport` so the peer can see what address we observed.

use super::message::header_param;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Add `;rport` to a Via we originate so the far end answers to our source port
pub fn add_rport_to_via(via: &str) -> String {
    if header_param(via, "rport").is_some() {
        via.to_string()
    } else {
        format!("{};rport", via)
    }
}

pub fn extract_rport_from_via(via: &str) -> Option<u16> {
    header_param(via, "rport").flatten()?.parse().ok()
}

pub fn extract_received_from_via(via: &str) -> Option<IpAddr> {
    header_param(via, "received").flatten()?.parse().ok()
}

/// Host part of the Via `sent-by`
fn sent_by_host(via: &str) -> Option<&str> {
    let sent_by = via.split(';').next()?.split_whitespace().nth(1)?;
    if let Some(v6) = sent_by.strip_prefix('[') {
        return v6.split(']').next();
    }
    Some(sent_by.split(':').next().unwrap_or(sent_by))
}

/// Stamp the top Via of a response with the observed source
///
/// `received` is added when the sent-by host differs from the source IP;
/// an empty `rport` is filled with the source port.
pub fn stamp_received(via: &str, source: SocketAddr) -> String {
    let mut parts: Vec<String> = via.split(';').map(|p| p.trim().to_string()).collect();

    let mut had_rport = false;
    for part in parts.iter_mut().skip(1) {
        let name = part.split('=').next().unwrap_or_default();
        if name.eq_ignore_ascii_case("rport") {
            *part = format!("rport={}", source.port());
            had_rport = true;
        }
    }

    let source_ip = source.ip().to_string();
    let needs_received = header_param(via, "received").is_none()
        && (had_rport || sent_by_host(via) != Some(source_ip.as_str()));
    if needs_received {
        parts.push(format!("received={}", source_ip));
    }

    let stamped = parts.join(";");
    if stamped != via {
        debug!(source = %source, "Stamped Via with received/rport");
    }
    stamped
}

/// Public address learned from our own Via in a response
pub fn public_address_from_via(via: &str) -> Option<SocketAddr> {
    let ip = extract_received_from_via(via)?;
    let port = extract_rport_from_via(via)?;
    Some(SocketAddr::new(ip, port))
}
