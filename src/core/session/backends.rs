//! Capability traits for the three pipeline stages the local session
//! drives. Acoustic and language modeling live behind these seams; the
//! core only schedules them.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionError;

/// Errors from an individual pipeline stage.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
    #[error("Engine timed out: {0}")]
    Timeout(String),
    #[error("Engine failed: {0}")]
    Failed(String),
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => SessionError::Unavailable(msg),
            BackendError::Timeout(msg) => SessionError::Timeout(msg),
            BackendError::Failed(msg) => SessionError::Internal(msg),
        }
    }
}

/// A finished transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// Speech-to-text over one captured utterance.
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Transcribe the captured PCM. Interim hypotheses may be pushed into
    /// `partials`; the final transcript is the return value.
    async fn transcribe(
        &self,
        pcm: Vec<i16>,
        partials: mpsc::Sender<String>,
    ) -> Result<Transcript, BackendError>;
}

/// Language model producing a streamed reply.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Start generating a reply for the transcript. The returned stream is
    /// finite and not restartable; dropping the receiver cancels it.
    async fn stream_reply(&self, transcript: &str)
        -> Result<mpsc::Receiver<String>, BackendError>;
}

/// Text-to-speech consuming a token stream incrementally.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize tokens into 20 ms PCM16 frame payloads pushed into
    /// `frames`. Must stop promptly when `cancel` fires and must not emit
    /// further frames afterwards.
    async fn synthesize(
        &self,
        tokens: mpsc::Receiver<String>,
        frames: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;
}
