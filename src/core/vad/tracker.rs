//! Speech/silence tracking over per-frame energy.
//!
//! # State transitions
//!
//! ```text
//! [Idle] ── energy > threshold for >= min_speech_ms ──► [Speaking] (SpeechStart)
//!
//! [Speaking] ── energy <= threshold ──► [Silence]  (SilenceDetected)
//!     ▲                                     │
//!     └──── energy > threshold ─────────────┘
//!                (SpeechResumed)
//!
//! [Silence] ── silence >= end_silence_ms ──► TurnEnd (latched until reset)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use crate::core::audio::AudioFrame;

/// Event emitted by the tracker during state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Sustained energy above threshold: the user started speaking.
    SpeechStart,
    /// Speech gave way to silence, but not yet long enough for a turn end.
    SilenceDetected,
    /// Speech resumed before the silence threshold was reached.
    SpeechResumed,
    /// Silence exceeded the threshold after sufficient speech; the user's
    /// turn is over.
    TurnEnd,
}

/// Configuration for speech tracking.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Normalized RMS energy above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Sustained speech required before `SpeechStart` fires (ms).
    pub min_speech_ms: u64,
    /// Sustained silence required before `TurnEnd` fires (ms).
    pub end_silence_ms: u64,
    /// Duration of one analysis frame (ms).
    pub frame_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            min_speech_ms: 120,
            end_silence_ms: 400,
            frame_ms: crate::core::audio::FRAME_DURATION_MS,
        }
    }
}

impl VadConfig {
    /// Derive a config from a policy variant's barge-in sensitivity.
    ///
    /// Sensitivity is in [0, 1]; higher sensitivity lowers the energy
    /// threshold and shortens the speech debounce, so barge-ins trigger on
    /// quieter and briefer speech.
    pub fn for_sensitivity(sensitivity: f32) -> Self {
        let s = sensitivity.clamp(0.0, 1.0);
        let base = Self::default();
        Self {
            energy_threshold: base.energy_threshold * (1.5 - s),
            min_speech_ms: if s >= 0.75 {
                base.min_speech_ms / 2
            } else {
                base.min_speech_ms
            },
            ..base
        }
    }
}

/// Tracks speech and silence durations over inbound frames.
///
/// Thread-safe; all mutable state is atomic so the tracker can be consulted
/// from the session loop without locking.
pub struct SpeechTracker {
    config: VadConfig,

    /// Whether a SpeechStart has been emitted for the current segment.
    in_speech: AtomicBool,
    /// Energy above threshold but SpeechStart not yet emitted (ms).
    pending_speech_ms: AtomicU64,
    /// Accumulated speech in the current segment (ms).
    speech_ms: AtomicU64,
    /// Accumulated silence since the last speech frame (ms).
    silence_ms: AtomicU64,
    /// TurnEnd already fired for this silence period.
    turn_end_fired: AtomicBool,
    /// Timestamp (frame ts_ms) of the frame that crossed into speech.
    speech_start_ts_ms: AtomicU64,
}

impl SpeechTracker {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            in_speech: AtomicBool::new(false),
            pending_speech_ms: AtomicU64::new(0),
            speech_ms: AtomicU64::new(0),
            silence_ms: AtomicU64::new(0),
            turn_end_fired: AtomicBool::new(false),
            speech_start_ts_ms: AtomicU64::new(0),
        }
    }

    /// Process one inbound frame and return any triggered event.
    pub fn process(&self, frame: &AudioFrame) -> Option<VadEvent> {
        let is_speech = frame.rms() > self.config.energy_threshold;
        if is_speech {
            self.on_speech_frame(frame)
        } else {
            self.on_silence_frame()
        }
    }

    fn on_speech_frame(&self, frame: &AudioFrame) -> Option<VadEvent> {
        let frame_ms = self.config.frame_ms;
        let was_in_speech = self.in_speech.load(Ordering::Acquire);
        let silence_before = self.silence_ms.swap(0, Ordering::AcqRel);

        if was_in_speech {
            self.speech_ms.fetch_add(frame_ms, Ordering::Relaxed);
            if silence_before > 0 && !self.turn_end_fired.load(Ordering::Acquire) {
                debug!(silence_before, "speech resumed within segment");
                return Some(VadEvent::SpeechResumed);
            }
            return None;
        }

        let pending = self.pending_speech_ms.fetch_add(frame_ms, Ordering::AcqRel) + frame_ms;
        if pending == frame_ms {
            // First frame above threshold anchors the segment timestamp
            self.speech_start_ts_ms
                .store(frame.ts_ms.saturating_sub(frame_ms), Ordering::Release);
        }
        if pending >= self.config.min_speech_ms {
            self.in_speech.store(true, Ordering::Release);
            self.turn_end_fired.store(false, Ordering::Release);
            self.speech_ms.fetch_add(pending, Ordering::Relaxed);
            self.pending_speech_ms.store(0, Ordering::Release);
            debug!(pending_ms = pending, "speech start");
            return Some(VadEvent::SpeechStart);
        }
        None
    }

    fn on_silence_frame(&self) -> Option<VadEvent> {
        let frame_ms = self.config.frame_ms;

        // A sub-threshold frame cancels a not-yet-confirmed speech onset.
        self.pending_speech_ms.store(0, Ordering::Release);

        let was_in_speech = self.in_speech.swap(false, Ordering::AcqRel);
        let silence = self.silence_ms.fetch_add(frame_ms, Ordering::AcqRel) + frame_ms;

        if was_in_speech {
            debug!(
                speech_ms = self.speech_ms.load(Ordering::Acquire),
                "silence after speech"
            );
            return Some(VadEvent::SilenceDetected);
        }

        if silence >= self.config.end_silence_ms
            && self.speech_ms.load(Ordering::Acquire) >= self.config.min_speech_ms
            && !self.turn_end_fired.swap(true, Ordering::AcqRel)
        {
            debug!(silence_ms = silence, "turn end");
            return Some(VadEvent::TurnEnd);
        }
        None
    }

    /// Reset for a new turn. Call after the captured segment was handed off.
    pub fn reset(&self) {
        self.in_speech.store(false, Ordering::Release);
        self.pending_speech_ms.store(0, Ordering::Release);
        self.speech_ms.store(0, Ordering::Release);
        self.silence_ms.store(0, Ordering::Release);
        self.turn_end_fired.store(false, Ordering::Release);
        self.speech_start_ts_ms.store(0, Ordering::Release);
    }

    /// Whether the tracker currently considers the user to be speaking.
    pub fn is_speaking(&self) -> bool {
        self.in_speech.load(Ordering::Acquire)
    }

    /// Accumulated speech in the current segment (ms).
    pub fn speech_ms(&self) -> u64 {
        self.speech_ms.load(Ordering::Acquire)
    }

    /// Timestamp of the frame that began the current speech segment.
    ///
    /// Barge-in latency is measured from this inbound timestamp.
    pub fn speech_start_ts_ms(&self) -> u64 {
        self.speech_start_ts_ms.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl Default for SpeechTracker {
    fn default() -> Self {
        Self::new(VadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::pcm_from_samples;
    use crate::core::audio::FRAME_SAMPLES;

    fn loud_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(
            seq,
            seq * 20,
            pcm_from_samples(&[8_000i16; FRAME_SAMPLES]),
        )
    }

    fn quiet_frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(seq, seq * 20)
    }

    #[test]
    fn test_speech_start_needs_sustained_energy() {
        let tracker = SpeechTracker::default();
        // 120 ms debounce = 6 frames at 20 ms
        for seq in 0..5 {
            assert_eq!(tracker.process(&loud_frame(seq)), None, "frame {seq}");
        }
        assert_eq!(tracker.process(&loud_frame(5)), Some(VadEvent::SpeechStart));
        assert!(tracker.is_speaking());
    }

    #[test]
    fn test_brief_noise_does_not_start_speech() {
        let tracker = SpeechTracker::default();
        tracker.process(&loud_frame(0));
        tracker.process(&loud_frame(1));
        // Silence cancels the pending onset
        assert_eq!(tracker.process(&quiet_frame(2)), None);
        // Counting starts over
        for seq in 3..8 {
            assert_eq!(tracker.process(&loud_frame(seq)), None);
        }
        assert_eq!(tracker.process(&loud_frame(8)), Some(VadEvent::SpeechStart));
    }

    #[test]
    fn test_turn_end_after_silence_threshold() {
        let tracker = SpeechTracker::default();
        let mut seq = 0;
        // Establish speech
        loop {
            if tracker.process(&loud_frame(seq)) == Some(VadEvent::SpeechStart) {
                break;
            }
            seq += 1;
        }
        // First silence frame flags the transition
        seq += 1;
        assert_eq!(
            tracker.process(&quiet_frame(seq)),
            Some(VadEvent::SilenceDetected)
        );
        // 400 ms = 20 frames of silence in total before TurnEnd
        let mut event = None;
        for _ in 0..19 {
            seq += 1;
            event = tracker.process(&quiet_frame(seq));
            if event.is_some() {
                break;
            }
        }
        assert_eq!(event, Some(VadEvent::TurnEnd));
        // Latched: more silence stays quiet
        seq += 1;
        assert_eq!(tracker.process(&quiet_frame(seq)), None);
    }

    #[test]
    fn test_speech_resumed_within_pause() {
        let tracker = SpeechTracker::default();
        let mut seq = 0;
        loop {
            if tracker.process(&loud_frame(seq)) == Some(VadEvent::SpeechStart) {
                break;
            }
            seq += 1;
        }
        seq += 1;
        assert_eq!(
            tracker.process(&quiet_frame(seq)),
            Some(VadEvent::SilenceDetected)
        );
        seq += 1;
        assert_eq!(
            tracker.process(&loud_frame(seq)),
            Some(VadEvent::SpeechResumed)
        );
    }

    #[test]
    fn test_silence_without_speech_never_ends_turn() {
        let tracker = SpeechTracker::default();
        for seq in 0..50 {
            assert_eq!(tracker.process(&quiet_frame(seq)), None);
        }
    }

    #[test]
    fn test_reset_clears_segment() {
        let tracker = SpeechTracker::default();
        for seq in 0..10 {
            tracker.process(&loud_frame(seq));
        }
        assert!(tracker.is_speaking());
        tracker.reset();
        assert!(!tracker.is_speaking());
        assert_eq!(tracker.speech_ms(), 0);
    }

    #[test]
    fn test_sensitivity_lowers_threshold() {
        let insensitive = VadConfig::for_sensitivity(0.0);
        let sensitive = VadConfig::for_sensitivity(1.0);
        assert!(sensitive.energy_threshold < insensitive.energy_threshold);
        assert!(sensitive.min_speech_ms < insensitive.min_speech_ms);
    }

    #[test]
    fn test_speech_start_timestamp_anchors_to_first_loud_frame() {
        let tracker = SpeechTracker::default();
        let mut seq = 10;
        loop {
            if tracker.process(&loud_frame(seq)) == Some(VadEvent::SpeechStart) {
                break;
            }
            seq += 1;
        }
        // Anchored near the first above-threshold frame (ts 200), not the
        // frame that confirmed the onset.
        assert!(tracker.speech_start_ts_ms() <= 200);
    }
}
