use std::time::Instant;

use crate::core::feedback::FeedbackSignals;

/// Behavioral signals accumulated while a call is live.
#[derive(Debug, Clone, Default)]
pub struct CallSignals {
    pub resolution: bool,
    pub user_rating: Option<u8>,
    pub barge_in_count: u32,
    pub repeats: u32,
    pub handover: bool,
}

/// In-memory state of one call, destroyed once feedback is recorded.
///
/// Carries no PII beyond the raw call id, which never leaves this struct
/// un-hashed.
#[derive(Debug)]
pub struct CallContext {
    pub call_id: String,
    pub profile: String,
    pub started_at: Instant,
    pub answered_at: Option<Instant>,
    pub policy_variant_id: Option<String>,
    pub signals: CallSignals,
    /// Last final transcript, for repeat detection.
    pub last_transcript: Option<String>,
}

impl CallContext {
    pub fn new(call_id: &str, profile: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            profile: profile.to_string(),
            started_at: Instant::now(),
            answered_at: None,
            policy_variant_id: None,
            signals: CallSignals::default(),
            last_transcript: None,
        }
    }

    /// Track a final transcript; near-identical consecutive turns count as
    /// the caller repeating themselves.
    pub fn note_transcript(&mut self, text: &str) {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return;
        }
        if self.last_transcript.as_deref() == Some(normalized.as_str()) {
            self.signals.repeats += 1;
        }
        self.last_transcript = Some(normalized);
    }

    /// Snapshot the signal vector for the reward calculation.
    pub fn feedback_signals(&self) -> FeedbackSignals {
        let duration_sec = self
            .answered_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        FeedbackSignals {
            resolution: self.signals.resolution,
            user_rating: self.signals.user_rating,
            barge_in_count: self.signals.barge_in_count,
            repeats: self.signals.repeats,
            handover: self.signals.handover,
            duration_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_detection_normalizes() {
        let mut ctx = CallContext::new("call-1", "general");
        ctx.note_transcript("I need help");
        assert_eq!(ctx.signals.repeats, 0);
        ctx.note_transcript("  i need HELP ");
        assert_eq!(ctx.signals.repeats, 1);
        ctx.note_transcript("something else");
        assert_eq!(ctx.signals.repeats, 1);
        ctx.note_transcript("something else");
        assert_eq!(ctx.signals.repeats, 2);
    }

    #[test]
    fn test_empty_transcript_is_ignored() {
        let mut ctx = CallContext::new("call-1", "general");
        ctx.note_transcript("   ");
        ctx.note_transcript("   ");
        assert_eq!(ctx.signals.repeats, 0);
        assert!(ctx.last_transcript.is_none());
    }

    #[test]
    fn test_signals_snapshot_before_answer_has_zero_duration() {
        let ctx = CallContext::new("call-1", "general");
        let signals = ctx.feedback_signals();
        assert_eq!(signals.duration_sec, 0.0);
        assert!(!signals.resolution);
    }
}
