//! Typed JSON messages of the gateway protocol.
//!
//! Audio travels as binary frames (see `core::audio::codec`); everything
//! else is a tagged JSON object with a `type` field.

use serde::{Deserialize, Serialize};

use crate::core::call::CallOutput;
use crate::core::session::TurnDurations;
use crate::errors::ErrorKind;

/// Messages the client sends as text.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection; binds it to a call.
    Hello {
        call_id: String,
        #[serde(default = "default_profile")]
        profile: String,
    },
    /// Orderly goodbye; may carry end-of-call feedback.
    Bye {
        #[serde(default)]
        resolution: Option<bool>,
        #[serde(default)]
        user_rating: Option<u8>,
    },
    /// Client-side barge-in signal.
    BargeIn { ts_ms: u64 },
    Ping { ts_ms: u64 },
}

fn default_profile() -> String {
    "general".to_string()
}

/// Messages the server sends as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SttPartial {
        text: String,
        ts_ms: u64,
    },
    SttFinal {
        text: String,
        ts_ms: u64,
    },
    LlmToken {
        text: String,
        ts_ms: u64,
    },
    TurnEnd {
        turn_id: u32,
        durations_ms: TurnDurations,
    },
    BargeIn {
        ts_ms: u64,
    },
    Pong {
        ts_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Bye {
        cause: String,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: kind.code().to_string(),
            message: message.into(),
        }
    }
}

impl From<CallOutput> for ServerMessage {
    fn from(output: CallOutput) -> Self {
        match output {
            CallOutput::SttPartial { text, ts_ms } => ServerMessage::SttPartial { text, ts_ms },
            CallOutput::SttFinal { text, ts_ms } => ServerMessage::SttFinal { text, ts_ms },
            CallOutput::LlmToken { text, ts_ms } => ServerMessage::LlmToken { text, ts_ms },
            CallOutput::TurnEnd { turn_id, durations } => ServerMessage::TurnEnd {
                turn_id,
                durations_ms: durations,
            },
            CallOutput::BargeInAck { ts_ms } => ServerMessage::BargeIn { ts_ms },
            CallOutput::Error { kind, message } => ServerMessage::error(kind, message),
            CallOutput::Ended { cause } => ServerMessage::Bye { cause },
        }
    }
}
