//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Verified writes.
//!
//! Every command is validated first, then sent with polling paused, then read
//! back until the device reports the requested state or the verification budget
//! runs out. An unconfirmed write is sent again after a backoff, up to the write
//! attempt budget. Polling resumes when the command returns, whatever the outcome.
use std::sync::Arc;

use r_bess_common::ControlConfig;
use r_bess_metrics::ControlMetrics;
use r_bess_proto::{
    Codec, EsMode, EsStatus, Method, ModeConfig, OperatingMode, Request, ScheduleSlot, SetModeAck,
    ValidationError,
};
use r_bess_transport::{DeviceLink, RequestOptions, RetryPolicy};
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::coordinator::{CoordinatorHandle, DeviceTarget};
use crate::error::{ControlError, Result};
use crate::pause::PauseGuard;
use crate::tier::Tier;

const TARGET: &str = "r_bess::control";

/// Battery flow a power action must produce.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Flow {
    Charging,
    Discharging,
    Stopped { threshold: i32 },
}

impl Flow {
    fn holds(self, power: f64) -> bool {
        match self {
            Flow::Charging => power < 0.0,
            Flow::Discharging => power > 0.0,
            Flow::Stopped { threshold } => power.abs() < f64::from(threshold),
        }
    }

    fn describe(self) -> String {
        match self {
            Flow::Charging => "battery charging (bat_power < 0)".to_string(),
            Flow::Discharging => "battery discharging (bat_power > 0)".to_string(),
            Flow::Stopped { threshold } => format!("battery idle (|bat_power| < {threshold})"),
        }
    }
}

/// What a write must produce before it counts as applied.
#[derive(Clone, Copy)]
enum Expected<'a> {
    Mode(&'a ModeConfig),
    Flow(Flow),
}

/// Executes state-changing commands against one device.
pub struct ControlExecutor {
    link: Arc<dyn DeviceLink>,
    codec: Arc<Codec>,
    config: ControlConfig,
    target: DeviceTarget,
    coordinator: Option<CoordinatorHandle>,
    metrics: Option<ControlMetrics>,
}

impl ControlExecutor {
    /// Executor for a device nobody is polling.
    pub fn new(
        link: Arc<dyn DeviceLink>,
        codec: Arc<Codec>,
        config: ControlConfig,
        target: DeviceTarget,
    ) -> Self {
        Self {
            link,
            codec,
            config,
            target,
            coordinator: None,
            metrics: None,
        }
    }

    /// Executor that pauses `coordinator` around each command and follows its target.
    pub fn for_coordinator(
        coordinator: &CoordinatorHandle,
        codec: Arc<Codec>,
        config: ControlConfig,
    ) -> Self {
        Self {
            link: coordinator.link(),
            codec,
            config,
            target: coordinator.target(),
            coordinator: Some(coordinator.clone()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ControlMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn target(&self) -> DeviceTarget {
        self.coordinator
            .as_ref()
            .map(CoordinatorHandle::target)
            .unwrap_or(self.target)
    }

    async fn pause(&self) -> Option<PauseGuard> {
        match &self.coordinator {
            Some(coordinator) => Some(coordinator.pause().await),
            None => None,
        }
    }

    /// Switch operating mode and confirm it through `ES.GetMode`.
    pub async fn set_mode(&self, mode: &ModeConfig) -> Result<()> {
        let result = self.apply_mode(mode).await;
        self.finish("set_mode", &result);
        result
    }

    async fn apply_mode(&self, mode: &ModeConfig) -> Result<()> {
        let target = self.target();
        let requests = self.codec.build_mode(mode, target.device_index)?;
        self.write_verified(target, &requests, Expected::Mode(mode)).await
    }

    /// Disable every schedule slot, one command per slot.
    ///
    /// Returns the cleared slot indices; a failure partway reports which slots
    /// were already acknowledged.
    pub async fn clear_schedules(&self) -> Result<Vec<u8>> {
        let result = self.clear_all().await;
        self.finish("clear_schedules", &result);
        result
    }

    async fn clear_all(&self) -> Result<Vec<u8>> {
        let target = self.target();
        let mut batches = Vec::new();
        for index in ScheduleSlot::all_indices() {
            let mode = ModeConfig::manual_slot(ScheduleSlot::disabled(index));
            batches.push((index, self.codec.build_mode(&mode, target.device_index)?));
        }

        let _paused = self.pause().await;
        let mut cleared = Vec::with_capacity(batches.len());
        for (index, requests) in batches {
            for request in &requests {
                if let Err(err) = self.write(target, request).await {
                    return Err(ControlError::PartialClear {
                        cleared,
                        failed_slot: index,
                        source: Box::new(err),
                    });
                }
            }
            cleared.push(index);
        }
        Ok(cleared)
    }

    /// Charge at `watts` through an all-day Manual slot 0.
    pub async fn charge(&self, watts: i32) -> Result<()> {
        let result = match positive(watts) {
            Ok(watts) => self.power_action(-watts, true, Flow::Charging).await,
            Err(err) => Err(err),
        };
        self.finish("charge", &result);
        result
    }

    /// Discharge at `watts` through an all-day Manual slot 0.
    pub async fn discharge(&self, watts: i32) -> Result<()> {
        let result = match positive(watts) {
            Ok(watts) => self.power_action(watts, true, Flow::Discharging).await,
            Err(err) => Err(err),
        };
        self.finish("discharge", &result);
        result
    }

    /// Disable slot 0 and wait for the battery to go idle.
    pub async fn stop(&self) -> Result<()> {
        let flow = Flow::Stopped {
            threshold: self.config.stop_power_threshold,
        };
        let result = self.power_action(0, false, flow).await;
        self.finish("stop", &result);
        result
    }

    async fn power_action(&self, power: i32, enabled: bool, flow: Flow) -> Result<()> {
        let target = self.target();
        let mode = ModeConfig::manual_slot(ScheduleSlot::all_day(0, power, enabled));
        let requests = self.codec.build_mode(&mode, target.device_index)?;
        self.write_verified(target, &requests, Expected::Flow(flow)).await
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.write_attempts.max(1) - 1,
            self.config.retry_backoff,
            self.config.retry_jitter,
        )
    }

    /// Write, settle and read back until confirmed or out of write attempts.
    ///
    /// Polling stays paused for the whole sequence, backoffs included. A lost
    /// acknowledgement still goes on to read-back since the device may have
    /// applied the write; a refusal ends the command at once.
    async fn write_verified(
        &self,
        target: DeviceTarget,
        requests: &[Request],
        expected: Expected<'_>,
    ) -> Result<()> {
        let policy = self.write_policy();
        let attempts = policy.attempts();
        let _paused = self.pause().await;
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = policy.backoff_delay(attempt - 1, &mut rand::thread_rng());
                warn!(
                    target: TARGET,
                    device = %target.addr,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "write not confirmed; retrying"
                );
                sleep(delay).await;
            }

            for request in requests {
                match self.write(target, request).await {
                    Ok(()) => {}
                    Err(ControlError::Transport(err)) => {
                        warn!(target: TARGET, device = %target.addr, attempt, error = %err, "write not acknowledged");
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            sleep(self.config.settle_delay).await;

            let outcome = match expected {
                Expected::Mode(mode) => self.verify_mode(target, mode, attempt).await,
                Expected::Flow(flow) => self.verify_flow(target, flow, attempt).await,
            };
            match outcome {
                Ok(()) => {
                    if attempt > 1 {
                        info!(target: TARGET, device = %target.addr, attempt, "write confirmed after retry");
                    }
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or(ControlError::Verification {
            expected: "a confirmed write".to_string(),
            observed: "nothing".to_string(),
            writes: attempts,
            attempts: 0,
        }))
    }

    async fn write(&self, target: DeviceTarget, request: &Request) -> Result<()> {
        let result = self
            .link
            .call(
                target.addr,
                request.method(),
                request.params().clone(),
                RequestOptions::default(),
            )
            .await?;
        if !SetModeAck::from_result(&result).accepted {
            return Err(ControlError::Refused {
                method: request.method().to_string(),
            });
        }
        Ok(())
    }

    async fn read(&self, target: DeviceTarget, method: Method) -> Result<Map<String, Value>> {
        let query = self.codec.build_query(method, target.device_index)?;
        Ok(self
            .link
            .call(
                target.addr,
                method,
                query.params().clone(),
                RequestOptions::default(),
            )
            .await?)
    }

    async fn verify_mode(
        &self,
        target: DeviceTarget,
        expected: &ModeConfig,
        writes: u32,
    ) -> Result<()> {
        let mut check = Verification::new(describe_mode(expected), writes);
        for attempt in 1..=self.config.verification_attempts.max(1) {
            if attempt > 1 {
                sleep(self.config.verification_interval).await;
            }
            match self.read(target, Method::EsGetMode).await {
                Ok(result) => match mode_matches(expected, &EsMode::from_result(&result)) {
                    Ok(()) => return Ok(()),
                    Err(observed) => check.mismatch(attempt, observed),
                },
                Err(err) => check.failed(attempt, err),
            }
        }
        Err(check.into_error(self.config.verification_attempts.max(1)))
    }

    async fn verify_flow(&self, target: DeviceTarget, flow: Flow, writes: u32) -> Result<()> {
        let mut check = Verification::new(flow.describe(), writes);
        for attempt in 1..=self.config.verification_attempts.max(1) {
            if attempt > 1 {
                sleep(self.config.verification_interval).await;
            }
            // The mode read is advisory: only a reported non-Manual mode fails it.
            if let Ok(result) = self.read(target, Method::EsGetMode).await {
                let mode = EsMode::from_result(&result).mode;
                if !mode.is_unknown() && mode != OperatingMode::Manual {
                    check.mismatch(attempt, format!("mode {}", mode.as_str()));
                    continue;
                }
            }
            match self.read(target, Method::EsGetStatus).await {
                Ok(result) => match EsStatus::from_result(&result).bat_power {
                    Some(power) if flow.holds(power) => return Ok(()),
                    Some(power) => check.mismatch(attempt, format!("bat_power {power}W")),
                    None => check.mismatch(attempt, "no bat_power reported".to_string()),
                },
                Err(err) => check.failed(attempt, err),
            }
        }
        Err(check.into_error(self.config.verification_attempts.max(1)))
    }

    fn finish<T>(&self, command: &'static str, result: &Result<T>) {
        let target = self.target();
        match result {
            Ok(_) => info!(target: TARGET, command, device = %target.addr, "command verified"),
            Err(err) => warn!(
                target: TARGET,
                command,
                device = %target.addr,
                kind = err.kind(),
                error = %err,
                "command failed"
            ),
        }
        if let Some(metrics) = &self.metrics {
            let outcome = match result {
                Ok(_) => "success",
                Err(err) => err.kind(),
            };
            metrics.record(command, outcome);
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.refresh_now(Tier::Fast);
        }
    }
}

/// Read-back bookkeeping shared by the verification loops.
struct Verification {
    expected: String,
    writes: u32,
    observed: Option<String>,
    last_error: Option<ControlError>,
}

impl Verification {
    fn new(expected: String, writes: u32) -> Self {
        Self {
            expected,
            writes,
            observed: None,
            last_error: None,
        }
    }

    fn mismatch(&mut self, attempt: u32, observed: String) {
        warn!(target: TARGET, attempt, expected = %self.expected, observed = %observed, "read-back mismatch");
        self.observed = Some(observed);
    }

    fn failed(&mut self, attempt: u32, err: ControlError) {
        warn!(target: TARGET, attempt, error = %err, "read-back failed");
        self.last_error = Some(err);
    }

    /// A device that never answered is a transport failure; one that answered
    /// with the wrong state is a verification failure.
    fn into_error(self, attempts: u32) -> ControlError {
        match (self.observed, self.last_error) {
            (Some(observed), _) => ControlError::Verification {
                expected: self.expected,
                observed,
                writes: self.writes,
                attempts,
            },
            (None, Some(err)) => err,
            (None, None) => ControlError::Verification {
                expected: self.expected,
                observed: "nothing".to_string(),
                writes: self.writes,
                attempts,
            },
        }
    }
}

fn positive(watts: i32) -> Result<i32> {
    if watts <= 0 {
        return Err(ValidationError::new("power", format!("power must be positive, got {watts}")).into());
    }
    Ok(watts)
}

fn describe_mode(mode: &ModeConfig) -> String {
    match mode {
        ModeConfig::Passive(target) => format!(
            "Passive (power {}W, cd_time {}s)",
            target.power, target.duration_secs
        ),
        other => other.wire_name().to_string(),
    }
}

/// Compare a mode report with the requested mode.
///
/// Passive parameters are only checked when the device reports them; the
/// countdown is accepted anywhere in `(0, duration]` since it runs down.
fn mode_matches(expected: &ModeConfig, observed: &EsMode) -> std::result::Result<(), String> {
    if !observed
        .mode
        .as_str()
        .eq_ignore_ascii_case(expected.wire_name())
    {
        return Err(format!("mode {}", observed.mode.as_str()));
    }
    if let (ModeConfig::Passive(target), Some(report)) = (expected, observed.passive) {
        if let Some(power) = report.power {
            if power != i64::from(target.power) {
                return Err(format!("Passive (power {power}W)"));
            }
        }
        if let Some(remaining) = report.cd_time {
            if remaining <= 0 || remaining > i64::from(target.duration_secs) {
                return Err(format!("Passive (cd_time {remaining}s)"));
            }
        }
    }
    Ok(())
}
