//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_bess_proto::{BatStatus, EmStatus, EsMode, EsStatus, Method, PvStatus, WifiStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Merged view of one device's telemetry.
///
/// Values only ever move forward on a usable reply; a failed call leaves the
/// previous value in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub device: String,
    pub target: SocketAddr,
    pub es_mode: Option<EsMode>,
    pub es_status: Option<EsStatus>,
    pub em_status: Option<EmStatus>,
    pub pv_status: Option<PvStatus>,
    pub wifi_status: Option<WifiStatus>,
    pub bat_status: Option<BatStatus>,
    /// Time of the last successful cycle.
    pub updated_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Set once failures reach the configured threshold.
    pub stale: bool,
    pub last_error: Option<String>,
}

impl StateSnapshot {
    pub fn new(device: impl Into<String>, target: SocketAddr) -> Self {
        Self {
            device: device.into(),
            target,
            es_mode: None,
            es_status: None,
            em_status: None,
            pv_status: None,
            wifi_status: None,
            bat_status: None,
            updated_at: None,
            consecutive_failures: 0,
            stale: false,
            last_error: None,
        }
    }

    /// Store one decoded result. Returns `false` for an unknown-mode report,
    /// which leaves the stored mode untouched.
    pub(crate) fn merge(&mut self, method: Method, result: &Map<String, Value>) -> bool {
        match method {
            Method::EsGetMode => {
                let mode = EsMode::from_result(result);
                if mode.mode.is_unknown() {
                    return false;
                }
                self.es_mode = Some(mode);
            }
            Method::EsGetStatus => self.es_status = Some(EsStatus::from_result(result)),
            Method::EmGetStatus => self.em_status = Some(EmStatus::from_result(result)),
            Method::PvGetStatus => self.pv_status = Some(PvStatus::from_result(result)),
            Method::WifiGetStatus => self.wifi_status = Some(WifiStatus::from_result(result)),
            Method::BatGetStatus => self.bat_status = Some(BatStatus::from_result(result)),
            Method::GetDevice | Method::BleGetStatus | Method::EsSetMode => {}
        }
        true
    }

    pub fn has_data(&self) -> bool {
        self.es_mode.is_some()
            || self.es_status.is_some()
            || self.em_status.is_some()
            || self.pv_status.is_some()
            || self.wifi_status.is_some()
            || self.bat_status.is_some()
    }

    /// Flat, presentation-friendly view of the populated values.
    pub fn fields(&self) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        let mut put = |key: &str, value: Value| {
            if !value.is_null() {
                out.insert(key.to_string(), value);
            }
        };

        if let Some(mode) = &self.es_mode {
            put("mode", json!(mode.mode.as_str()));
            if let Some(passive) = &mode.passive {
                put("passive_power", json!(passive.power));
                put("passive_remaining", json!(passive.cd_time));
            }
        }
        if let Some(status) = &self.es_status {
            put("battery_soc", json!(status.bat_soc));
            put("battery_power", json!(status.bat_power));
            put(
                "battery_status",
                json!(status.battery_flow().map(|flow| flow.to_string())),
            );
            put("battery_capacity", json!(status.bat_cap));
            put("pv_power", json!(status.pv_power));
            put("grid_power", json!(status.ongrid_power));
            put("offgrid_power", json!(status.offgrid_power));
            put("total_pv_energy", json!(status.total_pv_energy));
            put("total_grid_output_energy", json!(status.total_grid_output_energy));
            put("total_grid_input_energy", json!(status.total_grid_input_energy));
            put("total_load_energy", json!(status.total_load_energy));
        }
        if let Some(em) = &self.em_status {
            put("ct_connected", json!(em.ct_connected()));
            put("phase_a_power", json!(em.a_power));
            put("phase_b_power", json!(em.b_power));
            put("phase_c_power", json!(em.c_power));
            put("em_total_power", json!(em.total_power));
        }
        if let Some(pv) = &self.pv_status {
            for (n, channel) in pv.channels.iter().enumerate() {
                put(&format!("pv{}_power", n + 1), json!(channel.power));
                put(&format!("pv{}_voltage", n + 1), json!(channel.voltage));
                put(&format!("pv{}_current", n + 1), json!(channel.current));
            }
        }
        if let Some(wifi) = &self.wifi_status {
            put("wifi_rssi", json!(wifi.rssi));
            put("wifi_ssid", json!(wifi.ssid));
        }
        if let Some(bat) = &self.bat_status {
            put("battery_temperature", json!(bat.temperature));
            put("charge_allowed", json!(bat.charge_allowed));
            put("discharge_allowed", json!(bat.discharge_allowed));
            put("remaining_capacity", json!(bat.capacity));
            put("rated_capacity", json!(bat.rated_capacity));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_mode_keeps_previous_mode() {
        let mut snapshot = StateSnapshot::new("garage", "10.0.0.5:30000".parse().unwrap());
        assert!(snapshot.merge(Method::EsGetMode, &map(json!({"mode": "Auto"}))));
        assert!(!snapshot.merge(Method::EsGetMode, &map(json!({"mode": "Unknown"}))));
        assert_eq!(snapshot.es_mode.unwrap().mode.as_str(), "Auto");
    }

    #[test]
    fn fields_flatten_populated_values_only() {
        let mut snapshot = StateSnapshot::new("garage", "10.0.0.5:30000".parse().unwrap());
        assert!(!snapshot.has_data());
        snapshot.merge(
            Method::EsGetStatus,
            &map(json!({"bat_soc": 55, "bat_power": 120})),
        );
        let fields = snapshot.fields();
        assert_eq!(fields["battery_soc"], json!(55.0));
        assert_eq!(fields["battery_status"], json!("Selling"));
        assert!(!fields.contains_key("pv_power"));
        assert!(!fields.contains_key("mode"));
    }
}
