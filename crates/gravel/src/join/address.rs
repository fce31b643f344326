//! Join address validation.

use gravel_common::JoinError;
use std::net::SocketAddr;

/// Validate a `host:port` address and bring it to canonical form.
///
/// Hosts may be IPv4 literals, bracketed IPv6 literals or RFC 1123
/// hostnames; hostnames are lowercased. Port 0 is refused.
pub fn normalize_address(address: &str) -> Result<String, JoinError> {
    let trimmed = address.trim();
    let invalid = || JoinError::InvalidAddress(address.to_string());

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(invalid());
        }
        return Ok(addr.to_string());
    }

    let (host, port) = trimmed.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 || !is_hostname(host) {
        return Err(invalid());
    }

    Ok(format!("{}:{}", host.to_ascii_lowercase(), port))
}

fn is_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = host.split('.').collect();
    let well_formed = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    // All-numeric names are malformed IPv4 literals, not hostnames
    let numeric = labels
        .iter()
        .all(|label| label.chars().all(|c| c.is_ascii_digit()));

    well_formed && !numeric
}
