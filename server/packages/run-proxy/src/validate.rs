//! Inbound field validation and the clamping rules for caller-supplied
//! timeouts.

use std::time::Duration;

use run_proxy_error::RuntimeError;
use serde_json::Value;

pub const MAX_ID_LEN: usize = 200;

pub const DEFAULT_KEEPALIVE_TTL_SECONDS: u64 = 1800;
pub const DEFAULT_INIT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_PROMPT_TIMEOUT_MS: u64 = 3_600_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 30_000;

const KEEPALIVE_RANGE: (u64, u64) = (60, 86_400);
const INIT_TIMEOUT_RANGE: (u64, u64) = (1, 3_600);
const PROMPT_TIMEOUT_RANGE: (u64, u64) = (5_000, 24 * 3_600_000);
const AUTH_TIMEOUT_RANGE: (u64, u64) = (5_000, 300_000);

pub fn validate_run_id(raw: Option<&Value>) -> Result<String, RuntimeError> {
    let run_id = raw.map(value_to_string).unwrap_or_default();
    let run_id = run_id.trim();
    if run_id.is_empty() {
        return Err(RuntimeError::invalid("run_id empty"));
    }
    if run_id.chars().count() > MAX_ID_LEN {
        return Err(RuntimeError::invalid("run_id too long"));
    }
    if run_id.contains(['/', '\\']) {
        return Err(RuntimeError::invalid("run_id must not contain path separators"));
    }
    if run_id.contains(':') {
        return Err(RuntimeError::invalid("run_id must not contain ':'"));
    }
    Ok(run_id.to_string())
}

pub fn validate_instance_name(raw: &str) -> Result<String, RuntimeError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RuntimeError::invalid("instance_name empty"));
    }
    if name.chars().count() > MAX_ID_LEN {
        return Err(RuntimeError::invalid("instance_name too long"));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok {
        return Err(RuntimeError::invalid("instance_name contains invalid characters"));
    }
    Ok(name.to_string())
}

/// `run-proxy-run-<run_id>`, unless the command names its own instance.
pub fn instance_name_for(run_id: &str, requested: Option<&Value>) -> Result<String, RuntimeError> {
    match requested.and_then(Value::as_str).map(str::trim) {
        Some(name) if !name.is_empty() => validate_instance_name(name),
        _ => validate_instance_name(&default_instance_name(run_id)),
    }
}

pub fn default_instance_name(run_id: &str) -> String {
    format!("run-proxy-run-{run_id}")
}

pub fn keepalive_ttl_seconds(raw: Option<&Value>) -> u64 {
    clamp_number(raw, DEFAULT_KEEPALIVE_TTL_SECONDS, KEEPALIVE_RANGE)
}

pub fn init_timeout(raw: Option<&Value>) -> Duration {
    Duration::from_secs(clamp_number(raw, DEFAULT_INIT_TIMEOUT_SECONDS, INIT_TIMEOUT_RANGE))
}

pub fn prompt_timeout(raw: Option<&Value>) -> Duration {
    Duration::from_millis(clamp_number(raw, DEFAULT_PROMPT_TIMEOUT_MS, PROMPT_TIMEOUT_RANGE))
}

pub fn auth_timeout_from_env() -> Duration {
    let raw = std::env::var("RUN_PROXY_AUTH_TIMEOUT_MS").ok().map(Value::from);
    Duration::from_millis(clamp_number(raw.as_ref(), DEFAULT_AUTH_TIMEOUT_MS, AUTH_TIMEOUT_RANGE))
}

pub fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts numbers and numeric strings; anything else (or non-positive)
/// falls back to `default`. The result is clamped into `range`.
fn clamp_number(raw: Option<&Value>, default: u64, (min, max): (u64, u64)) -> u64 {
    let parsed = raw.and_then(|value| match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    });
    match parsed {
        Some(value) if value.is_finite() && value > 0.0 => (value as u64).clamp(min, max),
        _ => default,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_ids_reject_separators_and_length() {
        assert_eq!(validate_run_id(Some(&json!(" r1 "))).expect("ok"), "r1");
        assert_eq!(validate_run_id(Some(&json!(42))).expect("number"), "42");
        for bad in [json!(""), json!("a/b"), json!("a\\b"), json!("a:b"), json!("x".repeat(201))] {
            assert!(validate_run_id(Some(&bad)).is_err(), "{bad} should be rejected");
        }
        assert!(validate_run_id(None).is_err());
    }

    #[test]
    fn instance_names_follow_the_safe_alphabet() {
        assert!(validate_instance_name("run-proxy-run-r1").is_ok());
        assert!(validate_instance_name("a.b_c-1").is_ok());
        for bad in ["-lead", ".hidden", "has space", "semi;colon", ""] {
            assert!(validate_instance_name(bad).is_err(), "{bad} should be rejected");
        }
        assert_eq!(
            instance_name_for("r1", None).expect("default"),
            "run-proxy-run-r1"
        );
        assert_eq!(
            instance_name_for("r1", Some(&json!("custom"))).expect("custom"),
            "custom"
        );
    }

    #[test]
    fn timeouts_are_clamped() {
        assert_eq!(keepalive_ttl_seconds(None), 1800);
        assert_eq!(keepalive_ttl_seconds(Some(&json!(5))), 60);
        assert_eq!(keepalive_ttl_seconds(Some(&json!(999_999))), 86_400);
        assert_eq!(keepalive_ttl_seconds(Some(&json!("120"))), 120);
        assert_eq!(keepalive_ttl_seconds(Some(&json!(-1))), 1800);

        assert_eq!(init_timeout(None), Duration::from_secs(300));
        assert_eq!(init_timeout(Some(&json!(7200))), Duration::from_secs(3600));

        assert_eq!(prompt_timeout(None), Duration::from_millis(3_600_000));
        assert_eq!(prompt_timeout(Some(&json!(10))), Duration::from_millis(5_000));
        assert_eq!(
            prompt_timeout(Some(&json!(1e12))),
            Duration::from_millis(24 * 3_600_000)
        );
    }
}
