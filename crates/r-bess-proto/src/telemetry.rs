//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Typed views over response `result` mappings.
//!
//! Devices differ in which fields they report and whether numbers arrive as
//! integers or floats, so every decoder is tolerant: absent or mistyped fields
//! become `None` rather than errors.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display};

type Fields = Map<String, Value>;

fn num(map: &Fields, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn int(map: &Fields, key: &str) -> Option<i64> {
    map.get(key).and_then(|value| {
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|float| float.round() as i64))
    })
}

fn text(map: &Fields, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn flag(map: &Fields, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(value) => Some(*value),
        other => other.as_i64().map(|value| value != 0),
    }
}

/// `Marstek.GetDevice` result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device model string, e.g. `VenusE`.
    pub device: Option<String>,
    /// Firmware version.
    pub version: Option<i64>,
    /// SSID the device is attached to.
    pub wifi_name: Option<String>,
    /// Address the device reports for itself.
    pub ip: Option<String>,
    /// WiFi MAC as reported.
    pub wifi_mac: Option<String>,
    /// Bluetooth MAC as reported.
    pub ble_mac: Option<String>,
}

impl DeviceInfo {
    /// Decode a discovery result; `None` unless at least one identifying field is present.
    pub fn from_result(result: &Fields) -> Option<Self> {
        let info = Self {
            device: text(result, "device"),
            version: int(result, "ver"),
            wifi_name: text(result, "wifi_name"),
            ip: text(result, "ip"),
            wifi_mac: text(result, "wifi_mac"),
            ble_mac: text(result, "ble_mac"),
        };
        let identified = info.device.is_some()
            || info.ip.is_some()
            || info.ble_mac.is_some()
            || info.wifi_mac.is_some();
        identified.then_some(info)
    }
}

/// Direction of battery power flow derived from the sign of `bat_power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum BatteryFlow {
    /// Discharging (positive power).
    Selling,
    /// Charging (negative power).
    Buying,
    /// No flow.
    Idle,
}

impl BatteryFlow {
    /// Classify a signed battery power reading.
    pub fn from_power(power: f64) -> Self {
        if power > 0.0 {
            BatteryFlow::Selling
        } else if power < 0.0 {
            BatteryFlow::Buying
        } else {
            BatteryFlow::Idle
        }
    }
}

/// `ES.GetStatus` result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EsStatus {
    /// State of charge, percent.
    pub bat_soc: Option<f64>,
    /// Battery capacity, Wh.
    pub bat_cap: Option<f64>,
    /// Solar input, W.
    pub pv_power: Option<f64>,
    /// Grid power, W (positive exports).
    pub ongrid_power: Option<f64>,
    /// Off-grid outlet power, W.
    pub offgrid_power: Option<f64>,
    /// Battery power, W (positive discharges, negative charges).
    pub bat_power: Option<f64>,
    /// Lifetime PV energy.
    pub total_pv_energy: Option<f64>,
    /// Lifetime energy exported to the grid.
    pub total_grid_output_energy: Option<f64>,
    /// Lifetime energy imported from the grid.
    pub total_grid_input_energy: Option<f64>,
    /// Lifetime load energy.
    pub total_load_energy: Option<f64>,
}

impl EsStatus {
    /// Decode an `ES.GetStatus` result.
    pub fn from_result(result: &Fields) -> Self {
        Self {
            bat_soc: num(result, "bat_soc"),
            bat_cap: num(result, "bat_cap"),
            pv_power: num(result, "pv_power"),
            ongrid_power: num(result, "ongrid_power"),
            offgrid_power: num(result, "offgrid_power"),
            bat_power: num(result, "bat_power"),
            total_pv_energy: num(result, "total_pv_energy"),
            total_grid_output_energy: num(result, "total_grid_output_energy"),
            total_grid_input_energy: num(result, "total_grid_input_energy"),
            total_load_energy: num(result, "total_load_energy"),
        }
    }

    /// Flow direction, when battery power was reported.
    pub fn battery_flow(&self) -> Option<BatteryFlow> {
        self.bat_power.map(BatteryFlow::from_power)
    }
}

/// Operating mode as reported by `ES.GetMode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Self consumption.
    Auto,
    /// Vendor optimiser.
    Ai,
    /// Schedule driven.
    Manual,
    /// Fixed power with countdown.
    Passive,
    /// A mode name this build does not know.
    Other(String),
    /// Missing, or the device's explicit `Unknown` sentinel.
    Unknown,
}

impl OperatingMode {
    /// Map a wire mode name; matching is case-insensitive.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return OperatingMode::Unknown;
        };
        match raw.to_ascii_lowercase().as_str() {
            "auto" => OperatingMode::Auto,
            "ai" => OperatingMode::Ai,
            "manual" => OperatingMode::Manual,
            "passive" => OperatingMode::Passive,
            "unknown" => OperatingMode::Unknown,
            _ => OperatingMode::Other(raw.to_owned()),
        }
    }

    /// Whether this is the unknown sentinel.
    pub fn is_unknown(&self) -> bool {
        matches!(self, OperatingMode::Unknown)
    }

    /// Display name, matching the wire spelling for known modes.
    pub fn as_str(&self) -> &str {
        match self {
            OperatingMode::Auto => "Auto",
            OperatingMode::Ai => "AI",
            OperatingMode::Manual => "Manual",
            OperatingMode::Passive => "Passive",
            OperatingMode::Other(name) => name,
            OperatingMode::Unknown => "Unknown",
        }
    }
}

/// `passive_cfg` as echoed by `ES.GetMode`, when the firmware reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassiveReport {
    /// Power target, W.
    pub power: Option<i64>,
    /// Remaining countdown, seconds.
    pub cd_time: Option<i64>,
}

/// `ES.GetMode` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsMode {
    /// Current mode.
    pub mode: OperatingMode,
    /// Grid power, W.
    pub ongrid_power: Option<f64>,
    /// State of charge, percent.
    pub bat_soc: Option<f64>,
    /// Passive parameters, when reported.
    pub passive: Option<PassiveReport>,
}

impl EsMode {
    /// Decode an `ES.GetMode` result.
    pub fn from_result(result: &Fields) -> Self {
        let passive = result
            .get("passive_cfg")
            .and_then(Value::as_object)
            .map(|cfg| PassiveReport {
                power: int(cfg, "power"),
                cd_time: int(cfg, "cd_time"),
            });
        Self {
            mode: OperatingMode::parse(result.get("mode").and_then(Value::as_str)),
            ongrid_power: num(result, "ongrid_power"),
            bat_soc: num(result, "bat_soc"),
            passive,
        }
    }
}

/// `EM.GetStatus` result (CT clamp meter).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmStatus {
    /// Raw CT state: 0 not connected, 1 connected.
    pub ct_state: Option<i64>,
    /// Phase A power, W.
    pub a_power: Option<f64>,
    /// Phase B power, W.
    pub b_power: Option<f64>,
    /// Phase C power, W.
    pub c_power: Option<f64>,
    /// Sum over phases, W.
    pub total_power: Option<f64>,
}

impl EmStatus {
    /// Decode an `EM.GetStatus` result.
    pub fn from_result(result: &Fields) -> Self {
        Self {
            ct_state: int(result, "ct_state"),
            a_power: num(result, "a_power"),
            b_power: num(result, "b_power"),
            c_power: num(result, "c_power"),
            total_power: num(result, "total_power"),
        }
    }

    /// Whether the CT clamp is connected, when known.
    pub fn ct_connected(&self) -> Option<bool> {
        self.ct_state.map(|state| state == 1)
    }
}

/// One PV input channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PvChannel {
    /// Power, W.
    pub power: f64,
    /// Voltage, V.
    pub voltage: f64,
    /// Current, A.
    pub current: f64,
    /// Channel state flag.
    pub state: i64,
}

/// `PV.GetStatus` result, normalised to numbered channels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PvStatus {
    /// Channels in order; a single-channel device yields one entry.
    pub channels: Vec<PvChannel>,
}

impl PvStatus {
    /// Decode either the single-channel (`pv_power`) or four-channel (`pv1_power`..) shape.
    pub fn from_result(result: &Fields) -> Self {
        if result.contains_key("pv_power") {
            let power = num(result, "pv_power").unwrap_or_default();
            return Self {
                channels: vec![PvChannel {
                    power,
                    voltage: num(result, "pv_voltage").unwrap_or_default(),
                    current: num(result, "pv_current").unwrap_or_default(),
                    state: i64::from(power > 0.0),
                }],
            };
        }
        let channels = (1..=4)
            .map(|n| PvChannel {
                power: num(result, &format!("pv{n}_power")).unwrap_or_default(),
                voltage: num(result, &format!("pv{n}_voltage")).unwrap_or_default(),
                current: num(result, &format!("pv{n}_current")).unwrap_or_default(),
                state: int(result, &format!("pv{n}_state")).unwrap_or_default(),
            })
            .collect();
        Self { channels }
    }
}

/// `Wifi.GetStatus` result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WifiStatus {
    /// Signal strength, dBm.
    pub rssi: Option<i64>,
    /// Network name.
    pub ssid: Option<String>,
    /// Station address.
    pub sta_ip: Option<String>,
    /// Gateway.
    pub sta_gate: Option<String>,
    /// Netmask.
    pub sta_mask: Option<String>,
    /// DNS server.
    pub sta_dns: Option<String>,
}

impl WifiStatus {
    /// Decode a `Wifi.GetStatus` result.
    pub fn from_result(result: &Fields) -> Self {
        Self {
            rssi: int(result, "rssi"),
            ssid: text(result, "ssid"),
            sta_ip: text(result, "sta_ip"),
            sta_gate: text(result, "sta_gate"),
            sta_mask: text(result, "sta_mask"),
            sta_dns: text(result, "sta_dns"),
        }
    }
}

/// `Bat.GetStatus` result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatStatus {
    /// Pack state of charge, percent.
    pub soc: Option<f64>,
    /// Charging permitted.
    pub charge_allowed: Option<bool>,
    /// Discharging permitted.
    pub discharge_allowed: Option<bool>,
    /// Pack temperature, degrees Celsius.
    pub temperature: Option<f64>,
    /// Remaining capacity, Wh.
    pub capacity: Option<f64>,
    /// Rated capacity, Wh.
    pub rated_capacity: Option<f64>,
}

impl BatStatus {
    /// Decode a `Bat.GetStatus` result; flags may be booleans or integers.
    pub fn from_result(result: &Fields) -> Self {
        Self {
            soc: num(result, "soc"),
            charge_allowed: flag(result, "charg_flag"),
            discharge_allowed: flag(result, "dischrg_flag"),
            temperature: num(result, "bat_temp"),
            capacity: num(result, "bat_capacity"),
            rated_capacity: num(result, "rated_capacity"),
        }
    }
}

/// `ES.SetMode` acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetModeAck {
    /// Whether the device reported acceptance. Absent counts as accepted.
    pub accepted: bool,
}

impl SetModeAck {
    /// Decode an `ES.SetMode` result.
    pub fn from_result(result: &Fields) -> Self {
        Self {
            accepted: flag(result, "set_result").unwrap_or(true),
        }
    }
}
