//! Anonymized end-of-call feedback records and their persistence.
//!
//! A record never carries PII: the raw call id is hashed and the timestamp
//! rounded to the hour before anything reaches the store, and the store
//! refuses inputs that do not look anonymized.

mod store;

pub use store::{FeedbackStore, RewardOutbox, StoreError, StoreStats};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix that marks an anonymized call id.
const ANON_PREFIX: &str = "anon_";

/// Behavioral signals gathered over one call.
///
/// Missing signals default to neutral values, so a partially observed call
/// still produces a well-defined reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignals {
    /// Whether the caller's concern was resolved.
    #[serde(default)]
    pub resolution: bool,
    /// Caller rating 1..=5, if one was given.
    #[serde(default)]
    pub user_rating: Option<u8>,
    /// How often the caller interrupted the assistant.
    #[serde(default)]
    pub barge_in_count: u32,
    /// How often the caller had to repeat themselves.
    #[serde(default)]
    pub repeats: u32,
    /// Whether the call was handed over to a human.
    #[serde(default)]
    pub handover: bool,
    /// Call duration in seconds.
    #[serde(default = "default_duration")]
    pub duration_sec: f64,
}

fn default_duration() -> f64 {
    180.0
}

impl Default for FeedbackSignals {
    fn default() -> Self {
        Self {
            resolution: false,
            user_rating: None,
            barge_in_count: 0,
            repeats: 0,
            handover: false,
            duration_sec: default_duration(),
        }
    }
}

impl FeedbackSignals {
    /// Range-check the fields the schema constrains.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(rating) = self.user_rating {
            if !(1..=5).contains(&rating) {
                return Err(format!("user_rating must be within 1..=5, got {rating}"));
            }
        }
        if !self.duration_sec.is_finite() || self.duration_sec < 0.0 {
            return Err(format!("duration_sec must be non-negative, got {}", self.duration_sec));
        }
        Ok(())
    }
}

/// One anonymized end-of-call outcome, keyed by `(ts_hour, call_id_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// `anon_` + 16 hex chars of SHA-256 over the raw call id.
    pub call_id_hash: String,
    /// Unix timestamp rounded down to the hour.
    pub ts_hour: u64,
    /// Coarse caller profile (use-case bucket), never an identifier.
    pub profile: String,
    /// Variant the call ran under.
    pub policy_variant_id: String,
    pub signals: FeedbackSignals,
}

impl FeedbackEvent {
    /// Build an anonymized event from raw call data.
    pub fn anonymized(
        raw_call_id: &str,
        ts: u64,
        profile: &str,
        policy_variant_id: &str,
        signals: FeedbackSignals,
    ) -> Self {
        Self {
            call_id_hash: anonymize_call_id(raw_call_id),
            ts_hour: hour_bucket(ts),
            profile: profile.to_string(),
            policy_variant_id: policy_variant_id.to_string(),
            signals,
        }
    }

    /// Check the record is complete and anonymized.
    ///
    /// The store calls this before persisting anything; a record that still
    /// looks like raw input is rejected, not fixed up.
    pub fn validate(&self) -> Result<(), String> {
        if !self.call_id_hash.starts_with(ANON_PREFIX)
            || self.call_id_hash.len() != ANON_PREFIX.len() + 16
            || !self.call_id_hash[ANON_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        {
            return Err("call_id_hash is not anonymized".to_string());
        }
        if self.ts_hour % 3600 != 0 {
            return Err(format!(
                "ts_hour {} is not rounded to the hour",
                self.ts_hour
            ));
        }
        if self.profile.is_empty() {
            return Err("profile must not be empty".to_string());
        }
        if self.policy_variant_id.is_empty() {
            return Err("policy_variant_id must not be empty".to_string());
        }
        self.signals.validate()
    }
}

/// Hash a raw call id into its anonymized form.
pub fn anonymize_call_id(raw_call_id: &str) -> String {
    let digest = Sha256::digest(raw_call_id.as_bytes());
    format!("{ANON_PREFIX}{}", &hex::encode(digest)[..16])
}

/// Round a unix timestamp down to the hour.
pub fn hour_bucket(ts: u64) -> u64 {
    ts - ts % 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymize_is_stable_and_shaped() {
        let a = anonymize_call_id("call-123");
        let b = anonymize_call_id("call-123");
        assert_eq!(a, b);
        assert!(a.starts_with("anon_"));
        assert_eq!(a.len(), 21);
        assert_ne!(a, anonymize_call_id("call-124"));
    }

    #[test]
    fn test_hour_bucket() {
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(3600), 3600);
        assert_eq!(hour_bucket(3600 + 1799), 3600);
        assert_eq!(hour_bucket(7199), 3600);
    }

    #[test]
    fn test_anonymized_event_validates() {
        let event = FeedbackEvent::anonymized(
            "call-abc",
            1_700_003_333,
            "general",
            "v1a",
            FeedbackSignals::default(),
        );
        assert!(event.validate().is_ok());
        assert_eq!(event.ts_hour % 3600, 0);
    }

    #[test]
    fn test_raw_call_id_is_rejected() {
        let mut event = FeedbackEvent::anonymized(
            "call-abc",
            1_700_000_000,
            "general",
            "v1a",
            FeedbackSignals::default(),
        );
        event.call_id_hash = "call-abc".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_unrounded_timestamp_is_rejected() {
        let mut event = FeedbackEvent::anonymized(
            "call-abc",
            1_700_000_000,
            "general",
            "v1a",
            FeedbackSignals::default(),
        );
        event.ts_hour += 7;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_rating_out_of_range_is_rejected() {
        let signals = FeedbackSignals {
            user_rating: Some(6),
            ..Default::default()
        };
        assert!(signals.validate().is_err());
        let signals = FeedbackSignals {
            user_rating: Some(0),
            ..Default::default()
        };
        assert!(signals.validate().is_err());
    }

    #[test]
    fn test_missing_fields_default_to_neutral() {
        let signals: FeedbackSignals = serde_json::from_str("{}").unwrap();
        assert_eq!(signals, FeedbackSignals::default());
        assert_eq!(signals.duration_sec, 180.0);
    }
}
