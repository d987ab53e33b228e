//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`JoblineSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{JoblineSettings, LogFormat, UpstreamAuth};

/// Load settings from an optional file, then the process environment.
pub fn load_settings(path: Option<&Path>) -> Result<JoblineSettings> {
    match path {
        Some(path) => load_settings_from_path(path),
        None => {
            let mut settings = JoblineSettings::default();
            apply_env_overrides(&mut settings);
            settings.validate()?;
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env). If the file
/// contains invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<JoblineSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<JoblineSettings> {
    let defaults = serde_json::to_value(JoblineSettings::default())?;
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

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut JoblineSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using `lookup` as the variable source.
///
/// Integers must parse and fall within range; invalid values are logged and
/// ignored (file/default value is kept).
pub fn apply_overrides_from(settings: &mut JoblineSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBLINE_STORE_URL").or_else(|| env.string("REDIS_URL")) {
        settings.store.url = v;
    }
    if let Some(v) = env.u64("SESSION_EXPIRY_SECONDS", 1, 31_536_000) {
        settings.store.session_expiry_seconds = v;
    }
    if let Some(v) = env.u64("SESSION_CLEANUP_INTERVAL_SECONDS", 1, 86_400) {
        settings.store.cleanup_interval_seconds = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBLINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("JOBLINE_PORT", 0, 65_535) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = env.string("JOBLINE_INSTANCE_ID") {
        settings.instance_id = Some(v);
    }

    // ── Lease ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("JOBLINE_LEASE_TTL_SECS", 2, 3_600) {
        settings.lease.ttl_secs = v;
    }
    if let Some(v) = env.u64("JOBLINE_LEASE_RENEW_SECS", 1, 3_600) {
        settings.lease.renew_interval_secs = v;
    }

    // ── Upstream ────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBLINE_UPSTREAM_URL") {
        settings.upstream.url = v;
    }
    if let Some(v) = env.string("JOBLINE_UPSTREAM_API_KEY") {
        settings.upstream.api_key = Some(SecretString::from(v.as_str()));
    }
    if let Some(v) = env.string("JOBLINE_UPSTREAM_AUTH") {
        match UpstreamAuth::parse(&v) {
            Some(auth) => settings.upstream.auth = auth,
            None => tracing::warn!(key = "JOBLINE_UPSTREAM_AUTH", value = %v, "invalid auth style, ignoring"),
        }
    }
    if let Some(v) = env.string("JOBLINE_UPSTREAM_VOICE") {
        settings.upstream.voice = v;
    }

    // ── Catalog ─────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBLINE_CATALOG_URL") {
        settings.catalog.base_url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBLINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("JOBLINE_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            "json" => settings.logging.format = LogFormat::Json,
            "compact" | "text" => settings.logging.format = LogFormat::Compact,
            _ => tracing::warn!(key = "JOBLINE_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
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
    use super::*;
    use crate::errors::SettingsError;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> JoblineSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = JoblineSettings::default();
        apply_overrides_from(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"store": {"url": "memory://", "poolSize": 8}});
        let source = serde_json::json!({"store": {"url": "redis://cache"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["store"]["url"], "redis://cache");
        assert_eq!(merged["store"]["poolSize"], 8);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn session_timing_from_env() {
        let s = overrides(&[
            ("SESSION_EXPIRY_SECONDS", "600"),
            ("SESSION_CLEANUP_INTERVAL_SECONDS", "30"),
        ]);
        assert_eq!(s.store.session_expiry_seconds, 600);
        assert_eq!(s.store.cleanup_interval_seconds, 30);
    }

    #[test]
    fn invalid_numbers_are_ignored() {
        let s = overrides(&[
            ("SESSION_EXPIRY_SECONDS", "soon"),
            ("SESSION_CLEANUP_INTERVAL_SECONDS", "0"),
        ]);
        assert_eq!(s.store.session_expiry_seconds, 86_400);
        assert_eq!(s.store.cleanup_interval_seconds, 300);
    }

    #[test]
    fn store_url_prefers_jobline_var() {
        let s = overrides(&[
            ("REDIS_URL", "redis://fallback"),
            ("JOBLINE_STORE_URL", "sqlite:///tmp/x.db"),
        ]);
        assert_eq!(s.store.url, "sqlite:///tmp/x.db");
        let s = overrides(&[("REDIS_URL", "redis://fallback")]);
        assert_eq!(s.store.url, "redis://fallback");
    }

    #[test]
    fn empty_strings_are_ignored() {
        let s = overrides(&[("JOBLINE_HOST", "")]);
        assert_eq!(s.server.host, "0.0.0.0");
    }

    #[test]
    fn upstream_overrides() {
        let s = overrides(&[
            ("JOBLINE_UPSTREAM_URL", "wss://example.test/realtime"),
            ("JOBLINE_UPSTREAM_API_KEY", "key-1"),
            ("JOBLINE_UPSTREAM_AUTH", "bearer"),
            ("JOBLINE_UPSTREAM_VOICE", "alloy"),
        ]);
        assert_eq!(s.upstream.url, "wss://example.test/realtime");
        assert_eq!(s.upstream.api_key.as_ref().unwrap().expose_secret(), "key-1");
        assert_eq!(s.upstream.auth, UpstreamAuth::Bearer);
        assert_eq!(s.upstream.voice, "alloy");
    }

    #[test]
    fn log_format_override() {
        assert_eq!(
            overrides(&[("JOBLINE_LOG_FORMAT", "compact")]).logging.format,
            LogFormat::Compact
        );
        assert_eq!(
            overrides(&[("JOBLINE_LOG_FORMAT", "xml")]).logging.format,
            LogFormat::Json
        );
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range(" 7 ", 1, 10), Some(7));
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = read_file_layer(&dir.path().join("absent.json")).unwrap();
        assert_eq!(s.store.url, "memory://");
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobline.json");
        std::fs::write(
            &path,
            r#"{"store": {"url": "sqlite:///var/lib/jobline.db"}, "lease": {"ttlSecs": 30}}"#,
        )
        .unwrap();
        let s = read_file_layer(&path).unwrap();
        assert_eq!(s.store.url, "sqlite:///var/lib/jobline.db");
        assert_eq!(s.store.session_expiry_seconds, 86_400);
        assert_eq!(s.lease.ttl_secs, 30);
        assert_eq!(s.lease.renew_interval_secs, 5);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn file_with_invalid_lease_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.json");
        std::fs::write(&path, r#"{"lease": {"ttlSecs": 4, "renewIntervalSecs": 5}}"#).unwrap();
        let settings = read_file_layer(&path).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }
}
