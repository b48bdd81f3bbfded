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
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::validation::MAX_TIME_SLOTS;
use crate::ValidationError;

/// Wall-clock time of day at minute resolution, written `H:MM` or `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    /// Midnight.
    pub const MIDNIGHT: ClockTime = ClockTime { hour: 0, minute: 0 };
    /// Last minute of the day.
    pub const END_OF_DAY: ClockTime = ClockTime {
        hour: 23,
        minute: 59,
    };

    /// Construct from components, rejecting out-of-range values.
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Hour component.
    pub fn hour(self) -> u8 {
        self.hour
    }

    /// Minute component.
    pub fn minute(self) -> u8 {
        self.minute
    }

    /// Minutes since midnight.
    pub fn minutes(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::new("time", format!("must be in HH:MM format (got '{value}')"));
        let (hour, minute) = value.split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(hour) || hour.len() > 2 || !digits(minute) || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        ClockTime::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Day-of-week bitmask: mon=1, tue=2, wed=4, thu=8, fri=16, sat=32, sun=64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weekdays(u8);

impl Weekdays {
    /// No days.
    pub const NONE: Weekdays = Weekdays(0);
    /// Every day of the week.
    pub const ALL: Weekdays = Weekdays(127);

    const NAMES: [(&'static str, u8); 7] = [
        ("mon", 1),
        ("tue", 2),
        ("wed", 4),
        ("thu", 8),
        ("fri", 16),
        ("sat", 32),
        ("sun", 64),
    ];

    /// Wrap a raw bitmask, rejecting bits above Sunday.
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits <= Self::ALL.0).then_some(Self(bits))
    }

    /// Build a mask from three-letter day names (`mon`..`sun`), case-insensitive.
    pub fn from_names<I, S>(names: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bits = 0u8;
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            let bit = Self::NAMES
                .iter()
                .find(|(day, _)| *day == name)
                .map(|(_, bit)| *bit)
                .ok_or_else(|| ValidationError::new("week_set", format!("unknown day '{name}'")))?;
            bits |= bit;
        }
        Ok(Self(bits))
    }

    /// Raw bitmask.
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// One device-resident schedule window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    /// Slot index, `0..MAX_TIME_SLOTS`.
    pub index: u8,
    /// Window start.
    pub start: ClockTime,
    /// Window end; strictly after `start` when enabled.
    pub end: ClockTime,
    /// Days the window applies to.
    pub days: Weekdays,
    /// Signed power target in watts (negative charges, positive discharges).
    pub power: i32,
    /// Whether the slot is active.
    pub enabled: bool,
}

impl ScheduleSlot {
    /// The value written to a slot to clear it.
    pub fn disabled(index: u8) -> Self {
        Self {
            index,
            start: ClockTime::MIDNIGHT,
            end: ClockTime::MIDNIGHT,
            days: Weekdays::NONE,
            power: 0,
            enabled: false,
        }
    }

    /// All-day, every-day slot holding a fixed power.
    pub fn all_day(index: u8, power: i32, enabled: bool) -> Self {
        Self {
            index,
            start: ClockTime::MIDNIGHT,
            end: ClockTime::END_OF_DAY,
            days: Weekdays::ALL,
            power,
            enabled,
        }
    }

    /// Indices of every slot the device exposes.
    pub fn all_indices() -> impl Iterator<Item = u8> {
        0..MAX_TIME_SLOTS as u8
    }

    /// `manual_cfg` object as sent on the wire.
    pub fn to_manual_cfg(&self) -> Value {
        json!({
            "time_num": self.index,
            "start_time": self.start.to_string(),
            "end_time": self.end.to_string(),
            "week_set": self.days.bits(),
            "power": self.power,
            "enable": u8::from(self.enabled),
        })
    }
}

/// Power target held for a bounded duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveTarget {
    /// Signed power target in watts.
    pub power: i32,
    /// Countdown in seconds (`cd_time`).
    pub duration_secs: u32,
}

/// Operating-mode command payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeConfig {
    /// Device-managed self consumption.
    Auto,
    /// Vendor optimiser.
    Ai,
    /// Schedule driven; each slot is written with its own command.
    Manual {
        /// Slots to write.
        slots: Vec<ScheduleSlot>,
    },
    /// Fixed power for a bounded duration.
    Passive(PassiveTarget),
}

impl ModeConfig {
    /// Manual mode with a single slot.
    pub fn manual_slot(slot: ScheduleSlot) -> Self {
        ModeConfig::Manual { slots: vec![slot] }
    }

    /// Wire name of the mode.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ModeConfig::Auto => "Auto",
            ModeConfig::Ai => "AI",
            ModeConfig::Manual { .. } => "Manual",
            ModeConfig::Passive(_) => "Passive",
        }
    }

    /// `config` objects for `ES.SetMode`, one per command to send.
    pub fn to_wire_configs(&self) -> Vec<Value> {
        match self {
            ModeConfig::Auto => vec![json!({"mode": "Auto", "auto_cfg": {"enable": 1}})],
            ModeConfig::Ai => vec![json!({"mode": "AI", "ai_cfg": {"enable": 1}})],
            ModeConfig::Manual { slots } => slots
                .iter()
                .map(|slot| json!({"mode": "Manual", "manual_cfg": slot.to_manual_cfg()}))
                .collect(),
            ModeConfig::Passive(target) => vec![json!({
                "mode": "Passive",
                "passive_cfg": {"power": target.power, "cd_time": target.duration_secs},
            })],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_accepts_one_or_two_digit_hours() {
        assert_eq!("9:05".parse::<ClockTime>().unwrap(), ClockTime::new(9, 5).unwrap());
        assert_eq!("09:05".parse::<ClockTime>().unwrap().to_string(), "09:05");
        assert_eq!("23:59".parse::<ClockTime>().unwrap(), ClockTime::END_OF_DAY);
    }

    #[test]
    fn clock_time_rejects_bad_shapes() {
        for raw in ["24:00", "12:60", "12:5", "123:00", "12-00", "", ":30", "ab:cd", "+1:00"] {
            let err = raw.parse::<ClockTime>().expect_err(raw);
            assert_eq!(err.field, "time");
        }
    }

    #[test]
    fn weekdays_from_names() {
        let weekend = Weekdays::from_names(["sat", "SUN"]).unwrap();
        assert_eq!(weekend.bits(), 96);
        let all = Weekdays::from_names(["mon", "tue", "wed", "thu", "fri", "sat", "sun"]).unwrap();
        assert_eq!(all, Weekdays::ALL);
        assert!(Weekdays::from_names(["funday"]).is_err());
        assert!(Weekdays::from_bits(128).is_none());
    }

    #[test]
    fn disabled_slot_wire_shape() {
        let cfg = ScheduleSlot::disabled(4).to_manual_cfg();
        assert_eq!(
            cfg,
            json!({
                "time_num": 4,
                "start_time": "00:00",
                "end_time": "00:00",
                "week_set": 0,
                "power": 0,
                "enable": 0,
            })
        );
    }

    #[test]
    fn wire_configs_per_mode() {
        assert_eq!(
            ModeConfig::Auto.to_wire_configs(),
            vec![json!({"mode": "Auto", "auto_cfg": {"enable": 1}})]
        );
        assert_eq!(ModeConfig::Ai.to_wire_configs()[0]["mode"], "AI");
        let passive = ModeConfig::Passive(PassiveTarget {
            power: -2000,
            duration_secs: 1800,
        });
        assert_eq!(
            passive.to_wire_configs(),
            vec![json!({"mode": "Passive", "passive_cfg": {"power": -2000, "cd_time": 1800}})]
        );
        let manual = ModeConfig::Manual {
            slots: vec![ScheduleSlot::all_day(0, 800, true), ScheduleSlot::disabled(1)],
        };
        let configs = manual.to_wire_configs();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0]["manual_cfg"]["end_time"], "23:59");
        assert_eq!(configs[1]["manual_cfg"]["time_num"], 1);
    }
}
