//! Voice session capability and its three realizations: the in-process
//! pipeline, the remote provider adapter, and the failover controller that
//! composes both behind the same interface.

pub mod backends;
pub mod failover;
pub mod local;
pub mod provider;
pub mod stubs;

pub use failover::{FailoverConfig, FailoverSession, FailoverState, SessionFactory};
pub use local::{LocalSession, LocalSessionConfig};
pub use provider::{
    ProviderClientEvent, ProviderConnector, ProviderFrame, ProviderLink, ProviderOutbound,
    ProviderServerEvent, ProviderSession, WsProviderConnector,
};

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::audio::AudioFrame;
use crate::errors::ErrorKind;

/// Which implementation backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Provider,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Provider => "provider",
            BackendKind::Local => "local",
        }
    }

    pub fn other(&self) -> BackendKind {
        match self {
            BackendKind::Provider => BackendKind::Local,
            BackendKind::Local => BackendKind::Provider,
        }
    }
}

/// Identity of one session within a call.
///
/// A call owns exactly one live descriptor at a time; failover replaces the
/// descriptor together with the session it names.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub call_id: String,
    pub policy_variant_id: String,
    pub backend: BackendKind,
    pub created_at: SystemTime,
}

impl SessionDescriptor {
    pub fn new(call_id: &str, policy_variant_id: &str, backend: BackendKind) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            call_id: call_id.to_string(),
            policy_variant_id: policy_variant_id.to_string(),
            backend,
            created_at: SystemTime::now(),
        }
    }

    /// The same identity on the other backend, with a fresh session id.
    pub fn for_backend(&self, backend: BackendKind) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            call_id: self.call_id.clone(),
            policy_variant_id: self.policy_variant_id.clone(),
            backend,
            created_at: SystemTime::now(),
        }
    }
}

/// Per-stage timings of one assistant turn, in milliseconds.
///
/// Carried on `TurnEnded` so cost accounting downstream can attribute
/// STT/LLM/TTS seconds per backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnDurations {
    pub stt: u64,
    pub llm: u64,
    pub tts: u64,
    pub e2e: u64,
}

/// Events a session emits toward the call state machine.
///
/// The session knows only this channel, never the FSM; ordering follows the
/// audio that caused each event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// VAD: sustained user speech began at the given frame timestamp.
    UserSpeakingStart { ts_ms: u64 },
    /// VAD: the user's turn ended after sustained silence.
    UserSpeakingEnd { ts_ms: u64 },
    /// Interim transcript.
    SttPartial { text: String, ts_ms: u64 },
    /// Final transcript for the captured turn.
    SttFinal { text: String, ts_ms: u64 },
    /// One token of the streamed reply.
    LlmToken { text: String, ts_ms: u64 },
    /// First synthesized frame of the current turn reached the outbound
    /// queue; `latency_ms` measures from end of user speech.
    FirstAudio { ts_ms: u64, latency_ms: u64 },
    /// The assistant turn finished (all audio queued).
    TurnEnded { turn_id: u32, durations: TurnDurations },
    /// Output was stopped on request (barge-in path).
    OutputStopped { ts_ms: u64 },
    /// Backend or transport failure.
    Error { kind: ErrorKind, message: String },
    /// The session released its resources. Final event.
    Closed,
}

/// Errors surfaced by session operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend timed out: {0}")]
    Timeout(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Session is closed")]
    Closed,
    #[error("Internal session error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Map onto the wire-facing error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Unavailable(_) => ErrorKind::BackendUnavailable,
            SessionError::Timeout(_) => ErrorKind::BackendTimeout,
            SessionError::Transport(_) => ErrorKind::BackendUnavailable,
            SessionError::Closed => ErrorKind::BackendUnavailable,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Capability set every session backend realizes.
///
/// Mirrors what the call state machine needs and nothing more: feed frames
/// in, receive an ordered event stream, interrupt output, tear down.
/// `stop_output` and `close` are idempotent.
#[async_trait]
pub trait VoiceSession: Send + Sync {
    fn descriptor(&self) -> &SessionDescriptor;

    /// Open backend resources. Must be called once before any other method.
    async fn start(&self) -> Result<(), SessionError>;

    /// Synthesize a scripted phrase (greeting, apology) as one turn.
    async fn speak(&self, text: &str) -> Result<(), SessionError>;

    /// Feed one inbound audio frame.
    async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError>;

    /// Take the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>>;

    /// Stop producing output immediately, keeping at most 40 ms of queued
    /// audio. The 120 ms barge-in budget is measured to this completing.
    async fn stop_output(&self) -> Result<(), SessionError>;

    /// Release all resources. Safe to call more than once.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Milliseconds since the unix epoch; producer timestamps for frames and
/// events.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Buffer size for session event channels.
///
/// Large enough that a stalled consumer does not stall audio production
/// before backpressure elsewhere kicks in.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Send an event without blocking the audio path; a full channel drops the
/// event with a warning rather than stalling synthesis.
pub(crate) fn emit(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = tx.try_send(event) {
        tracing::warn!("session event dropped: {e}");
    }
}
