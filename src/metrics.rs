//! Metric names and helpers.
//!
//! Thin wrappers over the `metrics` facade so call sites stay greppable and
//! metric names live in one place. Installing an exporter is a deployment
//! concern, not handled here.

use metrics::{counter, gauge, histogram};

/// Record a call accepted by the gateway.
pub fn record_call_started() {
    gauge!("voxgate_calls_active").increment(1.0);
    counter!("voxgate_calls_total").increment(1);
}

/// Record a call fully ended.
pub fn record_call_ended() {
    gauge!("voxgate_calls_active").decrement(1.0);
}

/// Record a frame dropped by a full per-session queue.
pub fn record_backpressure_drop(direction: &'static str) {
    counter!("voxgate_frame_drops_total", "direction" => direction).increment(1);
}

/// Record which backend currently serves a session (1 = active).
pub fn set_active_backend(backend: &'static str, active: bool) {
    gauge!("voxgate_session_backend", "backend" => backend).set(if active { 1.0 } else { 0.0 });
}

/// Record a provider→local (or reverse) failover.
pub fn record_failover(from: &'static str, to: &'static str) {
    counter!("voxgate_provider_failover_total", "from" => from, "to" => to).increment(1);
}

/// Record a policy variant selection.
pub fn record_policy_pull(variant_id: &str) {
    counter!("voxgate_policy_pulls_total", "variant" => variant_id.to_string()).increment(1);
}

/// Record a variant moved onto the blacklist.
pub fn record_variant_blacklisted(variant_id: &str) {
    counter!("voxgate_policy_blacklisted_total", "variant" => variant_id.to_string()).increment(1);
}

/// Update the active/blacklisted variant gauges.
pub fn set_variant_counts(active: usize, blacklisted: usize) {
    gauge!("voxgate_policy_active_variants").set(active as f64);
    gauge!("voxgate_policy_blacklisted_variants").set(blacklisted as f64);
}

/// Record barge-in reaction latency (speech start to silenced output).
pub fn record_barge_in_latency(seconds: f64) {
    histogram!("voxgate_barge_in_latency_seconds").record(seconds);
}

/// Record turn first-audio latency (end of user speech to first frame out).
pub fn record_first_audio_latency(seconds: f64) {
    histogram!("voxgate_first_audio_latency_seconds").record(seconds);
}

/// Record a rejected connection or message at the gateway.
pub fn record_gateway_reject(reason: &'static str) {
    counter!("voxgate_gateway_rejects_total", "reason" => reason).increment(1);
}

/// Record a feedback event appended to the store.
pub fn record_feedback_stored() {
    counter!("voxgate_feedback_events_total").increment(1);
}

/// Record a reward parked in the outbox because persistence failed.
pub fn record_reward_parked() {
    counter!("voxgate_reward_outbox_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_do_not_panic_without_recorder() {
        record_call_started();
        record_call_ended();
        record_backpressure_drop("inbound");
        set_active_backend("provider", true);
        record_failover("provider", "local");
        record_policy_pull("v1a");
        record_variant_blacklisted("v3a");
        set_variant_counts(3, 1);
        record_barge_in_latency(0.08);
        record_first_audio_latency(0.6);
        record_gateway_reject("auth");
        record_feedback_stored();
        record_reward_parked();
    }
}
