use bytes::Bytes;

/// Sample rate every frame in the core uses.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Nominal frame length: 20 ms at 16 kHz mono.
pub const FRAME_SAMPLES: usize = 320;

/// Nominal frame payload size: 320 samples of 16-bit PCM.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Nominal frame duration in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;

/// One 20 ms chunk of 16-bit signed little-endian mono PCM at 16 kHz.
///
/// Frames are immutable once created; the payload is shared, not copied,
/// when a frame moves between queues. `seq` is strictly increasing per
/// direction within a session, so a gap signals a dropped frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned by the producer.
    pub seq: u64,
    /// Producer timestamp, milliseconds.
    pub ts_ms: u64,
    /// Raw PCM16-LE payload.
    pub pcm: Bytes,
}

impl AudioFrame {
    pub fn new(seq: u64, ts_ms: u64, pcm: Bytes) -> Self {
        Self { seq, ts_ms, pcm }
    }

    /// A frame of pure silence, used to pad outbound cadence after barge-in.
    pub fn silence(seq: u64, ts_ms: u64) -> Self {
        Self {
            seq,
            ts_ms,
            pcm: Bytes::from_static(&[0u8; FRAME_BYTES]),
        }
    }

    /// Number of samples in this frame.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Frame duration derived from the actual payload length.
    pub fn duration_ms(&self) -> u64 {
        (self.sample_count() as u64 * 1000) / SAMPLE_RATE_HZ as u64
    }

    /// Decode the payload into i16 samples.
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Root-mean-square amplitude normalized to [0, 1].
    ///
    /// This is the energy measure the VAD thresholds against.
    pub fn rms(&self) -> f32 {
        let samples = self.samples();
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    /// Whether the payload is a whole number of 16-bit samples.
    pub fn is_well_formed(&self) -> bool {
        !self.pcm.is_empty() && self.pcm.len() % 2 == 0
    }
}

/// Build a frame payload from i16 samples. Test and stub helper.
pub fn pcm_from_samples(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_frame_shape() {
        let frame = AudioFrame::silence(7, 140);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.ts_ms, 140);
        assert_eq!(frame.sample_count(), FRAME_SAMPLES);
        assert_eq!(frame.duration_ms(), FRAME_DURATION_MS);
        assert_eq!(frame.rms(), 0.0);
        assert!(frame.is_well_formed());
    }

    #[test]
    fn test_samples_round_trip() {
        let samples: Vec<i16> = (0..FRAME_SAMPLES as i16).collect();
        let frame = AudioFrame::new(0, 0, pcm_from_samples(&samples));
        assert_eq!(frame.samples(), samples);
    }

    #[test]
    fn test_rms_scales_with_amplitude() {
        let quiet = AudioFrame::new(0, 0, pcm_from_samples(&[100i16; FRAME_SAMPLES]));
        let loud = AudioFrame::new(1, 20, pcm_from_samples(&[10_000i16; FRAME_SAMPLES]));
        assert!(loud.rms() > quiet.rms());
        assert!(loud.rms() <= 1.0);
    }

    #[test]
    fn test_odd_payload_is_malformed() {
        let frame = AudioFrame::new(0, 0, Bytes::from_static(&[1, 2, 3]));
        assert!(!frame.is_well_formed());
    }

    #[test]
    fn test_duration_follows_payload() {
        // A 10 ms frame (160 samples) is legal on the wire even if the
        // nominal cadence is 20 ms.
        let frame = AudioFrame::new(0, 0, pcm_from_samples(&[0i16; 160]));
        assert_eq!(frame.duration_ms(), 10);
    }
}
