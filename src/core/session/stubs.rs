//! Reference engines for tests and local development.
//!
//! Deterministic, dependency-free stand-ins for the real STT/LLM/TTS
//! backends: the scripted STT returns a fixed transcript, the template LLM
//! streams a canned reply word by word, and the tone TTS emits shaped PCM
//! frames per token. Latencies are configurable so budget tests can model
//! slow engines.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backends::{BackendError, LlmEngine, SttEngine, Transcript, TtsEngine};
use crate::core::audio::{FRAME_BYTES, FRAME_SAMPLES};

/// STT stub returning a fixed transcript after a configurable delay.
pub struct ScriptedStt {
    pub transcript: String,
    pub latency: Duration,
    /// Emit one interim hypothesis before the final transcript.
    pub emit_partial: bool,
}

impl ScriptedStt {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            latency: Duration::from_millis(50),
            emit_partial: true,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl SttEngine for ScriptedStt {
    async fn transcribe(
        &self,
        pcm: Vec<i16>,
        partials: mpsc::Sender<String>,
    ) -> Result<Transcript, BackendError> {
        if pcm.is_empty() {
            return Err(BackendError::Failed("empty capture".to_string()));
        }
        if self.emit_partial {
            let half: String = {
                let words: Vec<&str> = self.transcript.split_whitespace().collect();
                words[..words.len().div_ceil(2)].join(" ")
            };
            let _ = partials.send(half).await;
        }
        tokio::time::sleep(self.latency).await;
        Ok(Transcript {
            text: self.transcript.clone(),
            confidence: 0.92,
        })
    }
}

/// STT stub that always fails; drives error-path tests.
pub struct FailingStt;

#[async_trait]
impl SttEngine for FailingStt {
    async fn transcribe(
        &self,
        _pcm: Vec<i16>,
        _partials: mpsc::Sender<String>,
    ) -> Result<Transcript, BackendError> {
        Err(BackendError::Unavailable("stt offline".to_string()))
    }
}

/// LLM stub streaming a canned reply one word at a time.
pub struct TemplateLlm {
    pub reply: String,
    pub first_token_latency: Duration,
    pub token_interval: Duration,
}

impl TemplateLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            first_token_latency: Duration::from_millis(40),
            token_interval: Duration::from_millis(10),
        }
    }

    pub fn with_first_token_latency(mut self, latency: Duration) -> Self {
        self.first_token_latency = latency;
        self
    }
}

#[async_trait]
impl LlmEngine for TemplateLlm {
    async fn stream_reply(
        &self,
        _transcript: &str,
    ) -> Result<mpsc::Receiver<String>, BackendError> {
        let (tx, rx) = mpsc::channel(64);
        let tokens: Vec<String> = self
            .reply
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect();
        let first = self.first_token_latency;
        let interval = self.token_interval;
        tokio::spawn(async move {
            tokio::time::sleep(first).await;
            for token in tokens {
                if tx.send(token).await.is_err() {
                    // Receiver dropped: generation is cancelled
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(rx)
    }
}

/// TTS stub producing a fixed number of tone frames per token.
pub struct ToneTts {
    pub frames_per_token: usize,
    pub synth_delay: Duration,
}

impl Default for ToneTts {
    fn default() -> Self {
        Self {
            frames_per_token: 2,
            synth_delay: Duration::from_millis(5),
        }
    }
}

impl ToneTts {
    fn tone_frame(step: usize) -> Bytes {
        let mut buf = Vec::with_capacity(FRAME_BYTES);
        for i in 0..FRAME_SAMPLES {
            // Simple 400 Hz-ish square wave, amplitude well above the VAD floor
            let phase = (step * FRAME_SAMPLES + i) / 20 % 2;
            let sample: i16 = if phase == 0 { 6_000 } else { -6_000 };
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        Bytes::from(buf)
    }
}

#[async_trait]
impl TtsEngine for ToneTts {
    async fn synthesize(
        &self,
        mut tokens: mpsc::Receiver<String>,
        frames: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let mut step = 0usize;
        while let Some(_token) = tokens.recv().await {
            if cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(self.synth_delay).await;
            for _ in 0..self.frames_per_token {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if frames.send(Self::tone_frame(step)).await.is_err() {
                    return Ok(());
                }
                step += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stt_returns_transcript_and_partial() {
        let stt = ScriptedStt::new("book me a table for two");
        let (tx, mut rx) = mpsc::channel(4);
        let result = stt.transcribe(vec![1i16; 320], tx).await.unwrap();
        assert_eq!(result.text, "book me a table for two");
        let partial = rx.recv().await.unwrap();
        assert!(result.text.starts_with(&partial));
    }

    #[tokio::test]
    async fn test_scripted_stt_rejects_empty_capture() {
        let stt = ScriptedStt::new("hello");
        let (tx, _rx) = mpsc::channel(4);
        assert!(stt.transcribe(Vec::new(), tx).await.is_err());
    }

    #[tokio::test]
    async fn test_template_llm_streams_all_tokens() {
        let llm = TemplateLlm::new("sure thing right away");
        let mut rx = llm.stream_reply("anything").await.unwrap();
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].trim(), "sure");
    }

    #[tokio::test]
    async fn test_tone_tts_emits_frames_and_honors_cancel() {
        let tts = ToneTts::default();
        let (token_tx, token_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { tts.synthesize(token_rx, frame_tx, cancel).await }
        });

        token_tx.send("hello".to_string()).await.unwrap();
        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(frame.len(), FRAME_BYTES);

        cancel.cancel();
        drop(token_tx);
        handle.await.unwrap().unwrap();
    }
}
