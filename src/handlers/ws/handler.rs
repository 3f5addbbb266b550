//! Axum WebSocket handler: one connection carries one call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::processor::{process_binary, process_text, CallWiring, Disposition};
use super::rate_limit::RateLimiter;
use crate::core::audio::{encode_frame, FrameBus};
use crate::core::call::{CallFsm, CallInput};
use crate::errors::ErrorKind;
use crate::state::AppState;

/// Budget for the client's hello after the socket opens.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the state machine to wind down after the socket is gone.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket call endpoint: upgrade, authenticate, spawn the call.
pub async fn ws_call_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Origin allowlist, default deny for browser contexts
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin)
        {
            warn!(origin, "connection rejected: origin not allowed");
            crate::metrics::record_gateway_reject("origin");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let token = params.get("token").cloned().or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    ws.on_upgrade(move |socket| handle_call_socket(socket, state, token))
}

async fn handle_call_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // The first message binds the connection to a call
    let (call_id, profile) = match await_hello(&mut receiver).await {
        Ok(hello) => hello,
        Err(message) => {
            crate::metrics::record_gateway_reject("validation");
            let _ = send_message(&mut sender, &message).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    // Authentication with one-shot nonce, bound to this call id
    if let Some(verifier) = &state.verifier {
        let authorized = token
            .as_deref()
            .ok_or_else(|| crate::auth::AuthError::InvalidToken("missing token".to_string()))
            .and_then(|t| verifier.authorize(t, &call_id, &state.nonces));
        if let Err(e) = authorized {
            warn!(call = %call_id, "authentication failed: {e}");
            crate::metrics::record_gateway_reject("auth");
            let _ = send_message(
                &mut sender,
                &ServerMessage::error(ErrorKind::Auth, e.to_string()),
            )
            .await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    info!(call = %call_id, profile = %profile, "call connection accepted");

    // Wire the call: frame bus, FSM, capture, message plumbing
    let bus = FrameBus::default();
    let (input_tx, input_rx) = mpsc::channel::<CallInput>(64);
    let (output_tx, mut output_rx) = mpsc::channel(256);
    let (msg_tx, msg_rx) = mpsc::channel::<ServerMessage>(256);
    let capture = state.recorder.start(&call_id);

    let fsm = CallFsm::new(
        state.call_deps.clone(),
        &call_id,
        &profile,
        bus.clone(),
        output_tx,
    );
    let fsm_handle = tokio::spawn(fsm.run(input_rx));

    // The accepted transport is the answered line
    let _ = input_tx.send(CallInput::IncomingCall).await;
    let _ = input_tx.send(CallInput::CallAnswered).await;

    // Forward call outputs into the message stream
    let forward_tx = msg_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(output) = output_rx.recv().await {
            let ended = matches!(output, crate::core::call::CallOutput::Ended { .. });
            if forward_tx.send(output.into()).await.is_err() {
                break;
            }
            if ended {
                break;
            }
        }
    });

    // Writer: JSON messages and outbound audio share the socket
    let writer = tokio::spawn(write_socket(
        sender,
        msg_rx,
        Arc::clone(&bus.outbound),
        capture.clone(),
    ));

    // Reader: rate limit, then route binary/text
    let wiring = CallWiring {
        bus: bus.clone(),
        inputs: input_tx.clone(),
        messages: msg_tx.clone(),
        capture,
        max_frame_bytes: state.config.max_frame_bytes,
    };
    let mut limiter = RateLimiter::new(state.config.rate_limit_msgs_per_sec);

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(call = %call_id, "socket error: {e}");
                break;
            }
        };
        if !limiter.check_message() {
            warn!(call = %call_id, "message rate limit exceeded");
            crate::metrics::record_gateway_reject("rate_limited");
            let _ = msg_tx
                .send(ServerMessage::error(
                    ErrorKind::RateLimited,
                    "message budget exhausted",
                ))
                .await;
            break;
        }
        let disposition = match message {
            Message::Binary(data) => process_binary(&wiring, &data),
            Message::Text(text) => process_text(&wiring, &text).await,
            Message::Ping(_) | Message::Pong(_) => Disposition::Continue,
            Message::Close(_) => break,
        };
        match disposition {
            Disposition::Continue => {}
            Disposition::Close(final_message) => {
                if let Some(final_message) = final_message {
                    let _ = msg_tx.send(final_message).await;
                }
                break;
            }
        }
    }

    // Teardown: the FSM winds the call down and records feedback
    let _ = input_tx.send(CallInput::Hangup).await;
    drop(wiring);
    drop(msg_tx);
    if tokio::time::timeout(TEARDOWN_TIMEOUT, fsm_handle).await.is_err() {
        warn!(call = %call_id, "call state machine did not finish in time");
    }
    state.recorder.stop(&call_id);
    forwarder.abort();
    let _ = writer.await;
    info!(call = %call_id, "call connection closed");
}

/// Wait for the binding `hello`, skipping protocol-level ping/pong.
async fn await_hello(
    receiver: &mut SplitStream<WebSocket>,
) -> Result<(String, String), ServerMessage> {
    let deadline = tokio::time::sleep(HELLO_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        let message = tokio::select! {
            _ = &mut deadline => {
                return Err(ServerMessage::error(
                    ErrorKind::Validation,
                    "no hello within budget",
                ));
            }
            message = receiver.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Hello { call_id, profile }) if !call_id.is_empty() => {
                        Ok((call_id, profile))
                    }
                    Ok(_) => Err(ServerMessage::error(
                        ErrorKind::Validation,
                        "expected hello as first message",
                    )),
                    Err(e) => Err(ServerMessage::error(ErrorKind::Validation, e.to_string())),
                };
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) => {
                return Err(ServerMessage::error(
                    ErrorKind::Validation,
                    "expected hello as first message",
                ));
            }
            Some(Err(_)) | None => {
                return Err(ServerMessage::error(
                    ErrorKind::Validation,
                    "connection closed before hello",
                ));
            }
        }
    }
}

/// Drain JSON messages and outbound audio onto the socket.
///
/// A `bye` is the last message: the writer closes the socket after it so
/// well-behaved clients see an orderly shutdown.
async fn write_socket(
    mut sender: SplitSink<WebSocket, Message>,
    mut msg_rx: mpsc::Receiver<ServerMessage>,
    outbound: Arc<crate::core::audio::FrameQueue>,
    capture: Option<Arc<crate::core::recorder::CaptureSink>>,
) {
    loop {
        tokio::select! {
            message = msg_rx.recv() => match message {
                Some(message) => {
                    let is_bye = matches!(message, ServerMessage::Bye { .. });
                    if send_message(&mut sender, &message).await.is_err() {
                        break;
                    }
                    if is_bye {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = outbound.recv() => {
                if let Some(capture) = &capture {
                    capture.write_frame(&frame);
                }
                if sender.send(Message::Binary(encode_frame(&frame))).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("failed to serialize server message: {e}");
            Ok(())
        }
    }
}
