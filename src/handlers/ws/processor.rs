//! Per-message processing for one call connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::{ClientMessage, ServerMessage};
use crate::core::audio::{decode_frame, FrameBus};
use crate::core::call::CallInput;
use crate::core::recorder::CaptureSink;
use crate::errors::ErrorKind;

/// What to do with the connection after a message was handled.
pub enum Disposition {
    Continue,
    /// Send the final message (if any) and close the connection.
    Close(Option<ServerMessage>),
}

/// Everything the receive loop needs to route one call's messages.
pub struct CallWiring {
    pub bus: FrameBus,
    pub inputs: mpsc::Sender<CallInput>,
    pub messages: mpsc::Sender<ServerMessage>,
    pub capture: Option<Arc<CaptureSink>>,
    pub max_frame_bytes: usize,
}

/// Handle one inbound binary message (an audio frame).
pub fn process_binary(wiring: &CallWiring, data: &[u8]) -> Disposition {
    if data.len() > wiring.max_frame_bytes {
        warn!(bytes = data.len(), "inbound frame over limit");
        crate::metrics::record_gateway_reject("frame_too_large");
        return Disposition::Close(Some(ServerMessage::error(
            ErrorKind::FrameTooLarge,
            format!("frame of {} bytes exceeds the limit", data.len()),
        )));
    }
    match decode_frame(data) {
        Ok((_, frame)) => {
            if let Some(capture) = &wiring.capture {
                capture.write_frame(&frame);
            }
            wiring.bus.inbound.push(frame);
            Disposition::Continue
        }
        Err(e) => {
            warn!("undecodable inbound frame: {e}");
            crate::metrics::record_gateway_reject("validation");
            Disposition::Close(Some(ServerMessage::error(
                ErrorKind::Validation,
                e.to_string(),
            )))
        }
    }
}

/// Handle one inbound text message.
pub async fn process_text(wiring: &CallWiring, text: &str) -> Disposition {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("malformed client message: {e}");
            crate::metrics::record_gateway_reject("validation");
            return Disposition::Close(Some(ServerMessage::error(
                ErrorKind::Validation,
                e.to_string(),
            )));
        }
    };

    match message {
        ClientMessage::Hello { .. } => {
            // The connection is already bound to a call
            debug!("duplicate hello ignored");
            Disposition::Continue
        }
        ClientMessage::BargeIn { ts_ms } => {
            let _ = wiring.inputs.send(CallInput::ClientBargeIn { ts_ms }).await;
            Disposition::Continue
        }
        ClientMessage::Ping { ts_ms } => {
            let _ = wiring.messages.send(ServerMessage::Pong { ts_ms }).await;
            Disposition::Continue
        }
        ClientMessage::Bye {
            resolution,
            user_rating,
        } => {
            let _ = wiring
                .inputs
                .send(CallInput::ClientBye {
                    resolution,
                    user_rating,
                })
                .await;
            // The FSM drives the goodbye; the socket closes when it ends
            Disposition::Continue
        }
    }
}
