mod env;
mod utils;
mod validation;

pub use utils::parse_bool;

use std::path::PathBuf;
use std::str::FromStr;

/// Failover policy between the remote provider backend and the in-process
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    ProviderOnly,
    LocalOnly,
    ProviderThenLocal,
    LocalThenProvider,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::ProviderOnly => "provider_only",
            BackendMode::LocalOnly => "local_only",
            BackendMode::ProviderThenLocal => "provider_then_local",
            BackendMode::LocalThenProvider => "local_then_provider",
        }
    }

    /// Whether this policy ever opens a provider session.
    pub fn uses_provider(&self) -> bool {
        !matches!(self, BackendMode::LocalOnly)
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider_only" => Ok(BackendMode::ProviderOnly),
            "local_only" => Ok(BackendMode::LocalOnly),
            "provider_then_local" => Ok(BackendMode::ProviderThenLocal),
            "local_then_provider" => Ok(BackendMode::LocalThenProvider),
            other => Err(format!(
                "Invalid BACKEND_MODE '{other}'. Expected one of: provider_only, local_only, \
                 provider_then_local, local_then_provider"
            )),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// Every recognized key is a typed field validated at startup; unknown keys
/// in the recognized families produce a warning so typos are never silent.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host for the gateway
    pub host: String,
    /// Bind port for the gateway
    pub port: u16,

    /// Failover policy (BACKEND_MODE)
    pub backend_mode: BackendMode,
    /// p95 latency threshold that arms a failover, in milliseconds
    pub fallback_trigger_ms: u64,
    /// Error count within the rolling window that triggers a failover
    pub fallback_error_burst: u32,
    /// Rolling error window, in seconds
    pub fallback_error_window_s: u64,
    /// Cooldown after a failover during which re-switching is inhibited
    pub fallback_cooldown_s: u64,

    /// Persisted bandit state file
    pub bandit_state_path: Option<PathBuf>,
    /// Persisted deploy state file
    pub deploy_state_path: Option<PathBuf>,
    /// Policy variant catalog document
    pub policy_catalog_path: Option<PathBuf>,
    /// Share of traffic routed to new variants (0..=1)
    pub traffic_split_new: f64,
    /// Share of traffic routed to uncertain variants (0..=1)
    pub traffic_split_uncertain: f64,
    /// Minimum pulls before a variant can be blacklisted
    pub blacklist_min_samples: u64,
    /// Mean reward at or below which a variant is blacklisted
    pub blacklist_min_reward: f64,

    /// Per-connection message budget, messages per second
    pub rate_limit_msgs_per_sec: u32,
    /// Maximum inbound binary message size in bytes
    pub max_frame_bytes: usize,

    /// Enable per-call PCM capture
    pub record_audio: bool,
    /// Recorder janitor retention, in hours
    pub record_retention_hours: u64,
    /// Directory for per-call captures
    pub record_path: PathBuf,
    /// Explicit operator opt-in to record while a provider backend is in use
    pub record_with_external_backend: bool,

    /// Hard gate on opening provider sessions at all
    pub allow_external_backend: bool,
    /// Remote provider duplex endpoint
    pub provider_url: Option<String>,

    /// Shared secret for HS256 token verification
    pub auth_secret: Option<String>,
    /// Public key (PEM) for RS256 token verification
    pub auth_public_key_path: Option<PathBuf>,
    /// Whether connections without a valid token are rejected
    pub auth_required: bool,

    /// Allowed browser origins; empty list denies every Origin-bearing request
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    /// Returns the socket address string for binding
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the recorder may be armed under the current backend policy.
    ///
    /// Recording while audio egresses to an external provider requires the
    /// separate operator opt-in.
    pub fn recorder_armed(&self) -> bool {
        if !self.record_audio {
            return false;
        }
        if self.backend_mode.uses_provider() && self.allow_external_backend {
            return self.record_with_external_backend;
        }
        true
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            backend_mode: BackendMode::ProviderThenLocal,
            fallback_trigger_ms: 800,
            fallback_error_burst: 3,
            fallback_error_window_s: 60,
            fallback_cooldown_s: 600,
            bandit_state_path: None,
            deploy_state_path: None,
            policy_catalog_path: None,
            traffic_split_new: 0.10,
            traffic_split_uncertain: 0.05,
            blacklist_min_samples: 20,
            blacklist_min_reward: -0.2,
            rate_limit_msgs_per_sec: 120,
            max_frame_bytes: 65536,
            record_audio: false,
            record_retention_hours: 24,
            record_path: PathBuf::from("./data/recordings"),
            record_with_external_backend: false,
            allow_external_backend: false,
            provider_url: None,
            auth_secret: None,
            auth_public_key_path: None,
            auth_required: false,
            allowed_origins: Vec::new(),
        }
    }
}
