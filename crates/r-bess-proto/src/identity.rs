//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Hardware-bound device identity, ordered by preference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StableId {
    /// Bluetooth MAC, normalised.
    BleMac(String),
    /// WiFi MAC, normalised.
    WifiMac(String),
    /// Network address; used only when the device reports no MAC.
    Address(IpAddr),
}

impl StableId {
    /// Normalised MAC, if this identity is MAC based.
    pub fn mac(&self) -> Option<&str> {
        match self {
            StableId::BleMac(mac) | StableId::WifiMac(mac) => Some(mac),
            StableId::Address(_) => None,
        }
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StableId::BleMac(mac) => write!(f, "ble:{mac}"),
            StableId::WifiMac(mac) => write!(f, "wifi:{mac}"),
            StableId::Address(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// Lowercase a MAC and insert colons when given twelve bare hex digits.
///
/// Anything else is returned trimmed and lowercased, unchanged in shape.
pub fn normalize_mac(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let hex: String = lowered
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        hex.as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    } else {
        lowered
    }
}

/// Pick the preferred identifier: BLE MAC, then WiFi MAC, then address.
///
/// Empty strings and the `"0"` placeholder count as absent.
pub fn select_stable_id(
    ble_mac: Option<&str>,
    wifi_mac: Option<&str>,
    address: IpAddr,
) -> StableId {
    let usable = |mac: Option<&str>| {
        mac.map(str::trim)
            .filter(|mac| !mac.is_empty() && *mac != "0")
            .map(normalize_mac)
    };
    if let Some(mac) = usable(ble_mac) {
        return StableId::BleMac(mac);
    }
    if let Some(mac) = usable(wifi_mac) {
        return StableId::WifiMac(mac);
    }
    StableId::Address(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5));

    #[test]
    fn normalizes_bare_and_separated_macs() {
        assert_eq!(normalize_mac("ACD929A74A38"), "ac:d9:29:a7:4a:38");
        assert_eq!(normalize_mac("AC-D9-29-A7-4A-38"), "ac:d9:29:a7:4a:38");
        assert_eq!(normalize_mac(" ac:d9:29:a7:4a:38 "), "ac:d9:29:a7:4a:38");
        assert_eq!(normalize_mac("not-a-mac"), "not-a-mac");
    }

    #[test]
    fn prefers_ble_then_wifi_then_address() {
        assert_eq!(
            select_stable_id(Some("ACD929A74A38"), Some("112233445566"), ADDR),
            StableId::BleMac("ac:d9:29:a7:4a:38".into())
        );
        assert_eq!(
            select_stable_id(Some(""), Some("112233445566"), ADDR),
            StableId::WifiMac("11:22:33:44:55:66".into())
        );
        assert_eq!(select_stable_id(Some("0"), None, ADDR), StableId::Address(ADDR));
        assert_eq!(select_stable_id(None, None, ADDR).mac(), None);
    }
}
