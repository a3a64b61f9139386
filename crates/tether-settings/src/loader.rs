//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject settings whose fields contradict each other.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    let server = &settings.server;
    if !server.ping_timeout_disabled && server.ping_timeout_ms <= server.ping_interval_ms {
        return Err(SettingsError::InvalidValue(format!(
            "server.pingTimeoutMs ({}) must exceed server.pingIntervalMs ({})",
            server.ping_timeout_ms, server.ping_interval_ms
        )));
    }
    if !server.path.starts_with('/') {
        return Err(SettingsError::InvalidValue(format!(
            "server.path {:?} must start with '/'",
            server.path
        )));
    }
    let reconnect = &settings.client.reconnect;
    if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
        return Err(SettingsError::InvalidValue(format!(
            "client.reconnect.multiplier ({}) must be at least 1",
            reconnect.multiplier
        )));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_with(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides_with(settings: &mut TetherSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server settings ─────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TETHER_WS_PATH") {
        settings.server.path = v;
    }
    if let Some(v) = env.u64("TETHER_PING_INTERVAL_MS", 100, 600_000) {
        settings.server.ping_interval_ms = v;
    }
    if let Some(v) = env.u64("TETHER_PING_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.ping_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.server.handshake_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_SERVER_ACK_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.ack_timeout_ms = v;
    }
    if let Some(v) = env.string("TETHER_AUTH_KEY") {
        settings.server.auth_key = Some(v);
    }
    if let Some(v) = env.u64("TETHER_AUTH_EXPIRY_SECS", 1, 31_536_000) {
        settings.server.auth_default_expiry_secs = v;
    }
    if let Some(v) = env.bool("TETHER_ALLOW_CLIENT_PUBLISH") {
        settings.server.allow_client_publish = v;
    }

    // ── Client settings ─────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_CLIENT_URI") {
        settings.client.uri = v;
    }
    if let Some(v) = env.u64("TETHER_ACK_TIMEOUT_MS", 100, 3_600_000) {
        settings.client.ack_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.client.connect_timeout_ms = v;
    }
    if let Some(v) = env.bool("TETHER_AUTO_RECONNECT") {
        settings.client.auto_reconnect = v;
    }

    // ── Logging settings ────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> TetherSettings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = TetherSettings::default();
        apply_overrides_with(&mut settings, &|name| env.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 8000, "host": "localhost"}
        });
        let source = serde_json::json!({
            "server": {"port": 9090}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, TetherSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "client": {"reconnect": {"maxDelayMs": 5000}}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.ping_interval_ms, 8_000);
        assert_eq!(settings.client.reconnect.max_delay_ms, 5000);
        assert_eq!(settings.client.reconnect.initial_delay_ms, 10_000);
    }

    #[test]
    fn load_array_replace_not_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"allowedOrigins": ["https://a.example"]}}"#).unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.allowed_origins, vec!["https://a.example"]);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_inconsistent_ping_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"pingIntervalMs": 30000, "pingTimeoutMs": 10000}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert!(matches!(
            validate(&settings).unwrap_err(),
            SettingsError::InvalidValue(_)
        ));
    }

    // ── validate ────────────────────────────────────────────────────

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&TetherSettings::default()).is_ok());
    }

    #[test]
    fn path_must_be_absolute() {
        let mut settings = TetherSettings::default();
        settings.server.path = "ws".into();
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn multiplier_below_one_rejected() {
        let mut settings = TetherSettings::default();
        settings.client.reconnect.multiplier = 0.5;
        assert!(validate(&settings).is_err());
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let settings = overrides(&[
            ("TETHER_PORT", "0"),
            ("TETHER_HOST", "0.0.0.0"),
            ("TETHER_PING_INTERVAL_MS", "1000"),
            ("TETHER_AUTH_KEY", "s3cret"),
            ("TETHER_ALLOW_CLIENT_PUBLISH", "off"),
            ("TETHER_CLIENT_URI", "ws://h/ws"),
            ("TETHER_LOG_JSON", "yes"),
        ]);
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.ping_interval_ms, 1000);
        assert_eq!(settings.server.auth_key.as_deref(), Some("s3cret"));
        assert!(!settings.server.allow_client_publish);
        assert_eq!(settings.client.uri, "ws://h/ws");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let settings = overrides(&[
            ("TETHER_PORT", "99999"),
            ("TETHER_PING_INTERVAL_MS", "5"),
            ("TETHER_AUTO_RECONNECT", "maybe"),
            ("TETHER_HOST", ""),
        ]);
        let defaults = TetherSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.server.ping_interval_ms, defaults.server.ping_interval_ms);
        assert_eq!(settings.client.auto_reconnect, defaults.client.auto_reconnect);
        assert_eq!(settings.server.host, defaults.server.host);
    }

    // ── parse helpers ───────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("x", 1, 65535), None);
        assert_eq!(parse_u64_range("30000", 1000, 600_000), Some(30_000));
        assert_eq!(parse_u64_range("700000", 1000, 600_000), None);
    }

    #[test]
    fn settings_path_under_tether_dir() {
        let path = settings_path();
        assert!(path.ends_with(".tether/settings.json"));
    }
}
