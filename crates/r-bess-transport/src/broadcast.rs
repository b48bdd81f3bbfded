//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use if_addrs::IfAddr;
use tracing::debug;

/// Broadcast destinations for `port`.
///
/// An explicit list wins. Otherwise the limited broadcast address plus every
/// non-loopback IPv4 interface's directed broadcast, minus addresses owned by
/// this host.
pub fn broadcast_targets(configured: &[Ipv4Addr], port: u16) -> Vec<SocketAddr> {
    if !configured.is_empty() {
        return configured
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), port))
            .collect();
    }

    let mut targets = BTreeSet::from([Ipv4Addr::BROADCAST]);
    let mut local = BTreeSet::new();
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                if let IfAddr::V4(v4) = &interface.addr {
                    local.insert(v4.ip);
                    if interface.is_loopback() {
                        continue;
                    }
                    if let Some(broadcast) = v4.broadcast {
                        targets.insert(broadcast);
                    }
                }
            }
        }
        Err(err) => {
            debug!(
                target: "r_bess::transport",
                error = %err,
                "interface enumeration failed; using limited broadcast only"
            );
        }
    }

    targets
        .difference(&local)
        .map(|ip| SocketAddr::new(IpAddr::V4(*ip), port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_targets_override_enumeration() {
        let targets = broadcast_targets(&[Ipv4Addr::LOCALHOST], 30000);
        assert_eq!(targets, vec!["127.0.0.1:30000".parse().unwrap()]);
    }

    #[test]
    fn enumeration_always_includes_limited_broadcast() {
        let targets = broadcast_targets(&[], 30000);
        assert!(targets.contains(&"255.255.255.255:30000".parse().unwrap()));
        assert!(targets.iter().all(|target| target.port() == 30000));
    }
}
