//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use r_bess_common::PollingConfig;
use r_bess_proto::Method;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Polling schedule grouped by how fast the data changes.
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
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Tier {
    /// Power flow and mode.
    Fast,
    /// Solar input.
    Medium,
    /// Diagnostics.
    Slow,
}

const FAST: &[Method] = &[Method::EsGetMode, Method::EsGetStatus, Method::EmGetStatus];
const MEDIUM: &[Method] = &[Method::PvGetStatus];
const SLOW: &[Method] = &[Method::WifiGetStatus, Method::BatGetStatus];

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Medium, Tier::Slow];

    /// Calls issued by one cycle, in order. Tiers never share a method.
    pub fn methods(self, config: &PollingConfig) -> &'static [Method] {
        match self {
            Tier::Fast => FAST,
            Tier::Medium if config.include_pv => MEDIUM,
            Tier::Medium => &[],
            Tier::Slow => SLOW,
        }
    }

    pub fn interval(self, config: &PollingConfig) -> Duration {
        match self {
            Tier::Fast => config.fast_interval,
            Tier::Medium => config.medium_interval,
            Tier::Slow => config.slow_interval,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}
