//! Expansion of configured `host:port` strings into transport addresses
//!
//! Declared order is preserved: the bootstrap client walks entries in the
//! order the operator wrote them, and each hostname expands to all of its
//! resolved addresses in resolver order. Resolution happens lazily, entry
//! by entry and pass by pass, so a transient DNS failure on one host does
//! not poison the others. Entries that cannot be parsed or resolved are
//! skipped with a warning rather than aborting the pass.

use std::net::{IpAddr, SocketAddr};

use tracing::warn;

/// Split a `host:port` entry, handling bracketed IPv6 (`[::1]:8300`).
pub(crate) fn split_host_port(entry: &str) -> Option<(String, u16)> {
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }

    let (host, port) = entry.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Resolve one host to its transport addresses, in resolver order.
///
/// IP literals never hit DNS. An empty result means the host could not be
/// resolved right now; the warning has already been emitted.
pub(crate) async fn resolve(host: &str, port: u16) -> Vec<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![SocketAddr::new(ip, port)];
    }

    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                warn!(host, "host resolved to no addresses; skipping");
            }
            addrs
        }
        Err(e) => {
            warn!(host, error = %e, "failed to resolve host; skipping");
            Vec::new()
        }
    }
}
