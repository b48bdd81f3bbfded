//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Field-level protocol constraints applied before a command leaves the process.
use serde_json::{Map, Value};

use crate::method::Method;
use crate::mode::ClockTime;
use crate::ValidationError;

/// Absolute ceiling on a signed power target, in watts.
pub const MAX_POWER: i64 = 5000;
/// Highest addressable device index.
pub const MAX_DEVICE_ID: i64 = 255;
/// Number of device-resident schedule slots.
pub const MAX_TIME_SLOTS: i64 = 10;
/// Largest valid weekday bitmask (all seven days).
pub const MAX_WEEK_SET: i64 = 127;
/// Longest passive-mode countdown, in seconds.
pub const MAX_PASSIVE_DURATION: i64 = 86_400;

const STRICT_POWER_LIMIT: i64 = MAX_POWER * 9 / 10;
const STRICT_MIN_SCHEDULE_MINUTES: u16 = 5;

const MODES: [&str; 4] = ["Auto", "AI", "Manual", "Passive"];

/// Suspicious-but-legal input flagged in strict mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrictWarning {
    /// Offending field.
    pub field: &'static str,
    /// Explanation.
    pub message: String,
}

type Checked<T> = Result<T, ValidationError>;

/// Validate `params` for `method`, returning strict warnings when requested.
pub(crate) fn validate(
    method: Method,
    params: &Map<String, Value>,
    strict: bool,
) -> Checked<Vec<StrictWarning>> {
    let spec = method.spec();
    if let Some(unknown) = params.keys().find(|key| !spec.allows(key)) {
        return Err(ValidationError::new(
            "params",
            format!("unknown parameter '{unknown}' for {method}"),
        ));
    }
    if let Some(missing) = spec.required.iter().find(|key| !params.contains_key(**key)) {
        return Err(ValidationError::new(
            *missing,
            format!("required by {method}"),
        ));
    }

    if let Some(id) = params.get("id") {
        int_in_range(id, "id", 0, MAX_DEVICE_ID)?;
    }
    if let Some(mac) = params.get("ble_mac") {
        if !mac.is_string() {
            return Err(ValidationError::new("ble_mac", "must be a string"));
        }
    }

    let mut warnings = Vec::new();
    if let Some(config) = params.get("config") {
        validate_mode_config(config, strict, &mut warnings)?;
    }
    Ok(warnings)
}

fn validate_mode_config(
    config: &Value,
    strict: bool,
    warnings: &mut Vec<StrictWarning>,
) -> Checked<()> {
    let config = config
        .as_object()
        .ok_or_else(|| ValidationError::new("config", "must be an object"))?;
    let mode = config
        .get("mode")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new("mode", "missing or not a string"))?;
    if !MODES.contains(&mode) {
        return Err(ValidationError::new(
            "mode",
            format!("must be one of {} (got '{mode}')", MODES.join(", ")),
        ));
    }

    match mode {
        "Manual" => {
            let cfg = sub_config(config, "manual_cfg", "Manual")?;
            validate_manual(cfg, strict, warnings)
        }
        "Passive" => {
            let cfg = sub_config(config, "passive_cfg", "Passive")?;
            let power = required(cfg, "power")?;
            let power = int_in_range(power, "power", -MAX_POWER, MAX_POWER)?;
            let cd_time = required(cfg, "cd_time")?;
            int_in_range(cd_time, "cd_time", 0, MAX_PASSIVE_DURATION)?;
            if strict {
                warn_power(power, warnings);
            }
            Ok(())
        }
        "Auto" => enable_flag_of(config, "auto_cfg"),
        _ => enable_flag_of(config, "ai_cfg"),
    }
}

fn validate_manual(
    cfg: &Map<String, Value>,
    strict: bool,
    warnings: &mut Vec<StrictWarning>,
) -> Checked<()> {
    for field in ["time_num", "start_time", "end_time", "week_set", "power", "enable"] {
        required(cfg, field)?;
    }
    int_in_range(&cfg["time_num"], "time_num", 0, MAX_TIME_SLOTS - 1)?;
    let start = time_field(&cfg["start_time"], "start_time")?;
    let end = time_field(&cfg["end_time"], "end_time")?;
    int_in_range(&cfg["week_set"], "week_set", 0, MAX_WEEK_SET)?;
    let power = int_in_range(&cfg["power"], "power", -MAX_POWER, MAX_POWER)?;
    let enabled = enable_flag(&cfg["enable"])?;

    if enabled && end <= start {
        return Err(ValidationError::new(
            "end_time",
            format!("{end} must be after start_time {start} for an enabled slot"),
        ));
    }
    if strict {
        warn_power(power, warnings);
        if enabled && end.minutes() - start.minutes() < STRICT_MIN_SCHEDULE_MINUTES {
            warnings.push(StrictWarning {
                field: "end_time",
                message: format!(
                    "schedule {start}-{end} is shorter than {STRICT_MIN_SCHEDULE_MINUTES} minutes"
                ),
            });
        }
    }
    Ok(())
}

fn warn_power(power: i64, warnings: &mut Vec<StrictWarning>) {
    if power.abs() > STRICT_POWER_LIMIT {
        warnings.push(StrictWarning {
            field: "power",
            message: format!("{power} W is above 90% of the {MAX_POWER} W ceiling"),
        });
    }
}

fn sub_config<'a>(
    config: &'a Map<String, Value>,
    key: &'static str,
    mode: &str,
) -> Checked<&'a Map<String, Value>> {
    config
        .get(key)
        .ok_or_else(|| ValidationError::new(key, format!("required for {mode} mode")))?
        .as_object()
        .ok_or_else(|| ValidationError::new(key, "must be an object"))
}

fn enable_flag_of(config: &Map<String, Value>, key: &'static str) -> Checked<()> {
    match config.get(key) {
        None => Ok(()),
        Some(Value::Object(cfg)) => cfg.get("enable").map_or(Ok(()), |v| enable_flag(v).map(|_| ())),
        Some(_) => Err(ValidationError::new(key, "must be an object")),
    }
}

fn required<'a>(cfg: &'a Map<String, Value>, field: &'static str) -> Checked<&'a Value> {
    cfg.get(field)
        .ok_or_else(|| ValidationError::new(field, "missing"))
}

fn int_in_range(value: &Value, field: &str, min: i64, max: i64) -> Checked<i64> {
    let number = value
        .as_i64()
        .ok_or_else(|| ValidationError::new(field, format!("must be an integer (got {value})")))?;
    if !(min..=max).contains(&number) {
        return Err(ValidationError::new(
            field,
            format!("{number} is outside {min}..={max}"),
        ));
    }
    Ok(number)
}

fn time_field(value: &Value, field: &str) -> Checked<ClockTime> {
    let raw = value
        .as_str()
        .ok_or_else(|| ValidationError::new(field, "must be a string"))?;
    raw.parse::<ClockTime>()
        .map_err(|err| ValidationError::new(field, err.message))
}

fn enable_flag(value: &Value) -> Checked<bool> {
    match value.as_i64() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(ValidationError::new(
            "enable",
            format!("must be 0 or 1 (got {value})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn manual(cfg: Value) -> Map<String, Value> {
        params(json!({"id": 0, "config": {"mode": "Manual", "manual_cfg": cfg}}))
    }

    fn slot(start: &str, end: &str, power: i64, enable: i64) -> Value {
        json!({
            "time_num": 0,
            "start_time": start,
            "end_time": end,
            "week_set": 127,
            "power": power,
            "enable": enable,
        })
    }

    #[test]
    fn rejects_unknown_and_missing_params() {
        let err = validate(Method::EsGetStatus, &params(json!({"id": 0, "verbose": true})), false)
            .unwrap_err();
        assert_eq!(err.field, "params");
        let err = validate(Method::EsSetMode, &params(json!({"id": 0})), false).unwrap_err();
        assert_eq!(err.field, "config");
    }

    #[test]
    fn device_index_bounds() {
        assert!(validate(Method::EsGetMode, &params(json!({"id": 255})), false).is_ok());
        let err = validate(Method::EsGetMode, &params(json!({"id": 256})), false).unwrap_err();
        assert_eq!(err.field, "id");
        let err = validate(Method::EsGetMode, &params(json!({"id": -1})), false).unwrap_err();
        assert_eq!(err.field, "id");
        let err = validate(Method::EsGetMode, &params(json!({"id": 1.5})), false).unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn power_ceiling_is_inclusive() {
        for power in [-5000, 0, 5000] {
            assert!(validate(Method::EsSetMode, &manual(slot("08:00", "09:00", power, 1)), false).is_ok());
        }
        for power in [-5001, 5001, 100_000] {
            let err = validate(Method::EsSetMode, &manual(slot("08:00", "09:00", power, 1)), false)
                .unwrap_err();
            assert_eq!(err.field, "power");
        }
    }

    #[test]
    fn enabled_slot_must_end_after_start() {
        let err = validate(Method::EsSetMode, &manual(slot("10:00", "10:00", 100, 1)), false)
            .unwrap_err();
        assert_eq!(err.field, "end_time");
        let err = validate(Method::EsSetMode, &manual(slot("22:00", "06:00", 100, 1)), false)
            .unwrap_err();
        assert_eq!(err.field, "end_time");
        // disabled slots are not ordered
        assert!(validate(Method::EsSetMode, &manual(slot("00:00", "00:00", 0, 0)), false).is_ok());
    }

    #[test]
    fn manual_field_checks() {
        let mut cfg = slot("08:00", "09:00", 0, 1);
        cfg["week_set"] = json!(128);
        assert_eq!(validate(Method::EsSetMode, &manual(cfg), false).unwrap_err().field, "week_set");

        let mut cfg = slot("08:00", "09:00", 0, 1);
        cfg["time_num"] = json!(10);
        assert_eq!(validate(Method::EsSetMode, &manual(cfg), false).unwrap_err().field, "time_num");

        let mut cfg = slot("08:00", "09:00", 0, 1);
        cfg["enable"] = json!(2);
        assert_eq!(validate(Method::EsSetMode, &manual(cfg), false).unwrap_err().field, "enable");

        let err = validate(Method::EsSetMode, &manual(slot("8:0", "09:00", 0, 1)), false).unwrap_err();
        assert_eq!(err.field, "start_time");

        let mut cfg = slot("08:00", "09:00", 0, 1);
        cfg.as_object_mut().unwrap().remove("week_set");
        assert_eq!(validate(Method::EsSetMode, &manual(cfg), false).unwrap_err().field, "week_set");
    }

    #[test]
    fn mode_specific_sub_configs_are_required() {
        let err = validate(Method::EsSetMode, &params(json!({"id": 0, "config": {"mode": "Manual"}})), false)
            .unwrap_err();
        assert_eq!(err.field, "manual_cfg");
        let err = validate(Method::EsSetMode, &params(json!({"id": 0, "config": {"mode": "Passive"}})), false)
            .unwrap_err();
        assert_eq!(err.field, "passive_cfg");
        let err = validate(
            Method::EsSetMode,
            &params(json!({"id": 0, "config": {"mode": "Passive", "passive_cfg": {"power": 100}}})),
            false,
        )
        .unwrap_err();
        assert_eq!(err.field, "cd_time");
        let err = validate(Method::EsSetMode, &params(json!({"id": 0, "config": {"mode": "Eco"}})), false)
            .unwrap_err();
        assert_eq!(err.field, "mode");
    }

    #[test]
    fn passive_duration_ceiling() {
        let ok = params(json!({"id": 0, "config": {"mode": "Passive", "passive_cfg": {"power": -2000, "cd_time": 86400}}}));
        assert!(validate(Method::EsSetMode, &ok, false).is_ok());
        let too_long = params(json!({"id": 0, "config": {"mode": "Passive", "passive_cfg": {"power": -2000, "cd_time": 86401}}}));
        assert_eq!(validate(Method::EsSetMode, &too_long, false).unwrap_err().field, "cd_time");
    }

    #[test]
    fn strict_mode_warns_without_blocking() {
        let lenient = validate(Method::EsSetMode, &manual(slot("08:00", "08:03", 4800, 1)), false).unwrap();
        assert!(lenient.is_empty());
        let strict = validate(Method::EsSetMode, &manual(slot("08:00", "08:03", 4800, 1)), true).unwrap();
        let fields: Vec<_> = strict.iter().map(|w| w.field).collect();
        assert_eq!(fields, vec!["power", "end_time"]);
        let calm = validate(Method::EsSetMode, &manual(slot("08:00", "12:00", 4500, 1)), true).unwrap();
        assert!(calm.is_empty());
    }
}
