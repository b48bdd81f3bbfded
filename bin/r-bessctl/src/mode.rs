//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for operators interacting with R-BESS devices."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use clap::Subcommand;
use r_bess_proto::{ClockTime, ModeConfig, PassiveTarget, ScheduleSlot, Weekdays};

#[derive(Debug, Clone, Subcommand)]
pub enum ModeCommand {
    /// Self consumption managed by the device.
    Auto,
    /// Vendor optimiser.
    Ai,
    /// Hold a fixed power for a limited time.
    Passive {
        /// Signed power in watts; negative charges, positive discharges.
        #[arg(long, allow_hyphen_values = true)]
        power: i32,
        /// Countdown in seconds.
        #[arg(long, value_name = "SECS")]
        duration: u32,
    },
    /// Write one schedule slot.
    Manual {
        #[arg(long, default_value_t = 0)]
        slot: u8,
        #[arg(long, default_value = "00:00")]
        start: ClockTime,
        #[arg(long, default_value = "23:59")]
        end: ClockTime,
        /// Comma separated day names (mon..sun) or `all`.
        #[arg(long, default_value = "all")]
        days: String,
        /// Signed power in watts; negative charges, positive discharges.
        #[arg(long, allow_hyphen_values = true)]
        power: i32,
        /// Write the slot disabled.
        #[arg(long)]
        disable: bool,
    },
}

impl ModeCommand {
    pub fn to_mode(&self) -> Result<ModeConfig> {
        Ok(match self {
            ModeCommand::Auto => ModeConfig::Auto,
            ModeCommand::Ai => ModeConfig::Ai,
            ModeCommand::Passive { power, duration } => ModeConfig::Passive(PassiveTarget {
                power: *power,
                duration_secs: *duration,
            }),
            ModeCommand::Manual {
                slot,
                start,
                end,
                days,
                power,
                disable,
            } => ModeConfig::manual_slot(ScheduleSlot {
                index: *slot,
                start: *start,
                end: *end,
                days: parse_days(days)?,
                power: *power,
                enabled: !disable,
            }),
        })
    }
}

fn parse_days(raw: &str) -> Result<Weekdays> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(Weekdays::ALL);
    }
    Ok(Weekdays::from_names(raw.split(',').filter(|day| !day.trim().is_empty()))?)
}
