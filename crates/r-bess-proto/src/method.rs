//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// Allow-listed protocol methods.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum Method {
    /// Device information; doubles as the discovery method.
    #[serde(rename = "Marstek.GetDevice")]
    #[strum(serialize = "Marstek.GetDevice")]
    GetDevice,
    /// Bluetooth link state.
    #[serde(rename = "BLE.GetStatus")]
    #[strum(serialize = "BLE.GetStatus")]
    BleGetStatus,
    /// Battery pack diagnostics.
    #[serde(rename = "Bat.GetStatus")]
    #[strum(serialize = "Bat.GetStatus")]
    BatGetStatus,
    /// Energy storage power flow and energy counters.
    #[serde(rename = "ES.GetStatus")]
    #[strum(serialize = "ES.GetStatus")]
    EsGetStatus,
    /// Current operating mode.
    #[serde(rename = "ES.GetMode")]
    #[strum(serialize = "ES.GetMode")]
    EsGetMode,
    /// Operating mode write.
    #[serde(rename = "ES.SetMode")]
    #[strum(serialize = "ES.SetMode")]
    EsSetMode,
    /// Photovoltaic input channels.
    #[serde(rename = "PV.GetStatus")]
    #[strum(serialize = "PV.GetStatus")]
    PvGetStatus,
    /// WiFi link diagnostics.
    #[serde(rename = "Wifi.GetStatus")]
    #[strum(serialize = "Wifi.GetStatus")]
    WifiGetStatus,
    /// Energy meter (CT clamp) readings.
    #[serde(rename = "EM.GetStatus")]
    #[strum(serialize = "EM.GetStatus")]
    EmGetStatus,
}

/// Parameter rules for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    /// Parameters that must be present.
    pub required: &'static [&'static str],
    /// Parameters that may be present.
    pub optional: &'static [&'static str],
    /// Whether the method changes device state.
    pub is_write: bool,
}

impl MethodSpec {
    /// Whether `name` is a recognised parameter.
    pub fn allows(&self, name: &str) -> bool {
        self.required.contains(&name) || self.optional.contains(&name)
    }
}

const DEVICE_SCOPED: MethodSpec = MethodSpec {
    required: &[],
    optional: &["id"],
    is_write: false,
};

impl Method {
    /// Parameter rules for this method.
    pub fn spec(self) -> MethodSpec {
        match self {
            Method::GetDevice => MethodSpec {
                required: &[],
                optional: &["ble_mac"],
                is_write: false,
            },
            Method::EsSetMode => MethodSpec {
                required: &["id", "config"],
                optional: &[],
                is_write: true,
            },
            Method::BleGetStatus
            | Method::BatGetStatus
            | Method::EsGetStatus
            | Method::EsGetMode
            | Method::PvGetStatus
            | Method::WifiGetStatus
            | Method::EmGetStatus => DEVICE_SCOPED,
        }
    }

    /// Wire name, e.g. `ES.GetStatus`.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Whether the method changes device state.
    pub fn is_write(self) -> bool {
        self.spec().is_write
    }
}
