use std::env;
use std::path::PathBuf;

use super::utils::parse_bool;
use super::validation::{validate_auth, validate_provider, validate_ranges, warn_unknown_keys};
use super::{BackendMode, ServerConfig};

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {key} '{raw}': {e}")),
        Err(_) => Ok(None),
    }
}

fn parse_bool_var(key: &str) -> Result<Option<bool>, String> {
    match env::var(key) {
        Ok(raw) => parse_bool(&raw)
            .map(Some)
            .ok_or_else(|| format!("Invalid {key} '{raw}': expected a boolean")),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads configuration from environment variables with the documented
    /// defaults, loading a `.env` file first if one is present. Malformed
    /// values are errors; unrecognized keys in the configuration families
    /// are warned about so typos are never silent.
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        warn_unknown_keys();

        let defaults = ServerConfig::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = parse_var::<u16>("PORT")?.unwrap_or(defaults.port);

        let backend_mode =
            parse_var::<BackendMode>("BACKEND_MODE")?.unwrap_or(defaults.backend_mode);
        let fallback_trigger_ms =
            parse_var::<u64>("FALLBACK_TRIGGER_MS")?.unwrap_or(defaults.fallback_trigger_ms);
        let fallback_error_burst =
            parse_var::<u32>("FALLBACK_ERROR_BURST")?.unwrap_or(defaults.fallback_error_burst);
        let fallback_error_window_s = parse_var::<u64>("FALLBACK_ERROR_WINDOW_S")?
            .unwrap_or(defaults.fallback_error_window_s);
        let fallback_cooldown_s =
            parse_var::<u64>("FALLBACK_COOLDOWN_S")?.unwrap_or(defaults.fallback_cooldown_s);

        let bandit_state_path = env::var("BANDIT_STATE_PATH").ok().map(PathBuf::from);
        let deploy_state_path = env::var("DEPLOY_STATE_PATH").ok().map(PathBuf::from);
        let policy_catalog_path = env::var("POLICY_CATALOG_PATH").ok().map(PathBuf::from);

        let traffic_split_new =
            parse_var::<f64>("TRAFFIC_SPLIT_NEW")?.unwrap_or(defaults.traffic_split_new);
        let traffic_split_uncertain = parse_var::<f64>("TRAFFIC_SPLIT_UNCERTAIN")?
            .unwrap_or(defaults.traffic_split_uncertain);
        let blacklist_min_samples =
            parse_var::<u64>("BLACKLIST_MIN_SAMPLES")?.unwrap_or(defaults.blacklist_min_samples);
        let blacklist_min_reward =
            parse_var::<f64>("BLACKLIST_MIN_REWARD")?.unwrap_or(defaults.blacklist_min_reward);

        let rate_limit_msgs_per_sec = parse_var::<u32>("RATE_LIMIT_MSGS_PER_SEC")?
            .unwrap_or(defaults.rate_limit_msgs_per_sec);
        let max_frame_bytes =
            parse_var::<usize>("MAX_FRAME_BYTES")?.unwrap_or(defaults.max_frame_bytes);

        let record_audio = parse_bool_var("RECORD_AUDIO")?.unwrap_or(defaults.record_audio);
        let record_retention_hours =
            parse_var::<u64>("RECORD_RETENTION_HOURS")?.unwrap_or(defaults.record_retention_hours);
        let record_path = env::var("RECORD_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.record_path);
        let record_with_external_backend = parse_bool_var("RECORD_WITH_EXTERNAL_BACKEND")?
            .unwrap_or(defaults.record_with_external_backend);

        let allow_external_backend =
            parse_bool_var("ALLOW_EXTERNAL_BACKEND")?.unwrap_or(defaults.allow_external_backend);
        let provider_url = env::var("PROVIDER_URL").ok();

        let auth_secret = env::var("AUTH_SECRET").ok();
        let auth_public_key_path = env::var("AUTH_PUBLIC_KEY_PATH").ok().map(PathBuf::from);
        let auth_required = parse_bool_var("AUTH_REQUIRED")?.unwrap_or(defaults.auth_required);

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = ServerConfig {
            host,
            port,
            backend_mode,
            fallback_trigger_ms,
            fallback_error_burst,
            fallback_error_window_s,
            fallback_cooldown_s,
            bandit_state_path,
            deploy_state_path,
            policy_catalog_path,
            traffic_split_new,
            traffic_split_uncertain,
            blacklist_min_samples,
            blacklist_min_reward,
            rate_limit_msgs_per_sec,
            max_frame_bytes,
            record_audio,
            record_retention_hours,
            record_path,
            record_with_external_backend,
            allow_external_backend,
            provider_url,
            auth_secret,
            auth_public_key_path,
            auth_required,
            allowed_origins,
        };

        validate_ranges(&config)?;
        validate_auth(&config)?;
        validate_provider(&config)?;

        Ok(config)
    }
}
