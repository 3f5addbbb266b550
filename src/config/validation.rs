use std::env;
use std::path::Path;

use tracing::warn;

use super::ServerConfig;

/// Environment keys this crate recognizes.
///
/// Used both for documentation and for the typo check in
/// [`warn_unknown_keys`].
pub const KNOWN_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "BACKEND_MODE",
    "FALLBACK_TRIGGER_MS",
    "FALLBACK_ERROR_BURST",
    "FALLBACK_ERROR_WINDOW_S",
    "FALLBACK_COOLDOWN_S",
    "BANDIT_STATE_PATH",
    "DEPLOY_STATE_PATH",
    "POLICY_CATALOG_PATH",
    "TRAFFIC_SPLIT_NEW",
    "TRAFFIC_SPLIT_UNCERTAIN",
    "BLACKLIST_MIN_SAMPLES",
    "BLACKLIST_MIN_REWARD",
    "RATE_LIMIT_MSGS_PER_SEC",
    "MAX_FRAME_BYTES",
    "RECORD_AUDIO",
    "RECORD_RETENTION_HOURS",
    "RECORD_PATH",
    "RECORD_WITH_EXTERNAL_BACKEND",
    "ALLOW_EXTERNAL_BACKEND",
    "PROVIDER_URL",
    "AUTH_SECRET",
    "AUTH_PUBLIC_KEY_PATH",
    "AUTH_REQUIRED",
    "ALLOWED_ORIGINS",
];

/// Prefix families that belong to this crate's configuration surface.
///
/// Any environment key starting with one of these that is not in
/// [`KNOWN_KEYS`] is almost certainly a typo and gets a startup warning.
const KEY_FAMILIES: &[&str] = &[
    "FALLBACK_",
    "BANDIT_",
    "DEPLOY_",
    "TRAFFIC_SPLIT_",
    "BLACKLIST_",
    "RATE_LIMIT_",
    "RECORD_",
    "POLICY_",
];

/// Warn about unrecognized keys in our configuration families.
pub fn warn_unknown_keys() {
    for (key, _) in env::vars() {
        let in_family = KEY_FAMILIES.iter().any(|p| key.starts_with(p));
        if in_family && !KNOWN_KEYS.contains(&key.as_str()) {
            warn!("Unrecognized configuration key '{key}' (possible typo); ignoring");
        }
    }
}

/// Validate numeric ranges that the contract fixes.
pub fn validate_ranges(config: &ServerConfig) -> Result<(), String> {
    if !(0.0..=1.0).contains(&config.traffic_split_new) {
        return Err(format!(
            "TRAFFIC_SPLIT_NEW must be within [0, 1], got {}",
            config.traffic_split_new
        ));
    }
    if !(0.0..=1.0).contains(&config.traffic_split_uncertain) {
        return Err(format!(
            "TRAFFIC_SPLIT_UNCERTAIN must be within [0, 1], got {}",
            config.traffic_split_uncertain
        ));
    }
    if config.fallback_trigger_ms == 0 {
        return Err("FALLBACK_TRIGGER_MS must be positive".to_string());
    }
    if config.fallback_error_burst == 0 {
        return Err("FALLBACK_ERROR_BURST must be positive".to_string());
    }
    if config.fallback_error_window_s == 0 {
        return Err("FALLBACK_ERROR_WINDOW_S must be positive".to_string());
    }
    if config.blacklist_min_samples == 0 {
        return Err("BLACKLIST_MIN_SAMPLES must be positive".to_string());
    }
    if config.blacklist_min_reward > 0.0 {
        return Err(format!(
            "BLACKLIST_MIN_REWARD must be non-positive, got {}",
            config.blacklist_min_reward
        ));
    }
    if config.rate_limit_msgs_per_sec == 0 {
        return Err("RATE_LIMIT_MSGS_PER_SEC must be positive".to_string());
    }
    if config.max_frame_bytes == 0 {
        return Err("MAX_FRAME_BYTES must be positive".to_string());
    }
    Ok(())
}

/// Validate auth configuration consistency.
///
/// When auth is required, at least one verification method must be
/// configured, and a configured public key file must exist.
pub fn validate_auth(config: &ServerConfig) -> Result<(), String> {
    if let Some(path) = &config.auth_public_key_path {
        if !Path::new(path).exists() {
            return Err(format!(
                "AUTH_PUBLIC_KEY_PATH file does not exist: {}",
                path.display()
            ));
        }
    }
    if config.auth_required && config.auth_secret.is_none() && config.auth_public_key_path.is_none()
    {
        return Err(
            "AUTH_REQUIRED=true needs either AUTH_SECRET or AUTH_PUBLIC_KEY_PATH".to_string(),
        );
    }
    Ok(())
}

/// Validate provider configuration consistency.
pub fn validate_provider(config: &ServerConfig) -> Result<(), String> {
    if let Some(raw) = &config.provider_url {
        let parsed = url::Url::parse(raw).map_err(|e| format!("Invalid PROVIDER_URL: {e}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(format!(
                "PROVIDER_URL must be a ws:// or wss:// endpoint, got scheme '{}'",
                parsed.scheme()
            ));
        }
    }
    if config.backend_mode.uses_provider()
        && config.allow_external_backend
        && config.provider_url.is_none()
    {
        return Err(format!(
            "BACKEND_MODE={} with ALLOW_EXTERNAL_BACKEND=true requires PROVIDER_URL",
            config.backend_mode.as_str()
        ));
    }
    Ok(())
}
