use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    emit, now_ms, BackendKind, SessionDescriptor, SessionError, SessionEvent, TurnDurations,
    VoiceSession, EVENT_CHANNEL_CAPACITY,
};
use crate::core::audio::{decode_frame, encode_frame, AudioFrame, FrameQueue};
use crate::errors::ErrorKind;

/// Frames kept after a barge-in flush, same allowance as the local session.
const BARGE_IN_KEEP_FRAMES: usize = 2;

/// Control messages sent to the remote endpoint as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderClientEvent {
    Hello {
        session_id: String,
        call_id: String,
        variant_id: String,
    },
    BargeIn {
        ts_ms: u64,
    },
    Speak {
        text: String,
    },
    Bye,
}

/// Events the remote endpoint sends as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderServerEvent {
    UserSpeakingStart { ts_ms: u64 },
    UserSpeakingEnd { ts_ms: u64 },
    SttPartial { text: String, ts_ms: u64 },
    SttFinal { text: String, ts_ms: u64 },
    LlmToken { text: String, ts_ms: u64 },
    TurnEnd { turn_id: u32, durations_ms: TurnDurations },
    Error { code: String, message: String },
}

/// Everything that can arrive from the provider.
#[derive(Debug)]
pub enum ProviderFrame {
    Event(ProviderServerEvent),
    Audio(AudioFrame),
}

/// Everything the session sends to the provider.
#[derive(Debug)]
pub enum ProviderOutbound {
    Audio(AudioFrame),
    Event(ProviderClientEvent),
}

/// A live duplex channel pair to the provider.
pub struct ProviderLink {
    pub to_provider: mpsc::Sender<ProviderOutbound>,
    pub from_provider: mpsc::Receiver<ProviderFrame>,
}

/// Opens provider links; injectable so tests can wire channel pairs
/// instead of a network connection.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn open(&self, descriptor: &SessionDescriptor) -> Result<ProviderLink, SessionError>;
}

/// Production connector over a persistent WebSocket connection.
///
/// Binary messages carry the 12-byte audio header plus PCM16 in both
/// directions; control and transcript events travel as JSON text.
pub struct WsProviderConnector {
    url: String,
}

impl WsProviderConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ProviderConnector for WsProviderConnector {
    async fn open(&self, descriptor: &SessionDescriptor) -> Result<ProviderLink, SessionError> {
        let (stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| SessionError::Unavailable(format!("provider connect failed: {e}")))?;
        info!(session = %descriptor.session_id, url = %self.url, "provider connection open");

        let (mut ws_write, mut ws_read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ProviderOutbound>(64);
        let (in_tx, in_rx) = mpsc::channel::<ProviderFrame>(EVENT_CHANNEL_CAPACITY);

        // Writer pump: session -> wire
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let message = match outbound {
                    ProviderOutbound::Audio(frame) => Message::Binary(encode_frame(&frame)),
                    ProviderOutbound::Event(event) => match serde_json::to_string(&event) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            warn!("provider event serialization failed: {e}");
                            continue;
                        }
                    },
                };
                if let Err(e) = ws_write.send(message).await {
                    warn!("provider write failed: {e}");
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        // Reader pump: wire -> session
        tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let frame = match message {
                    Ok(Message::Binary(data)) => match decode_frame(&data) {
                        Ok((_, frame)) => ProviderFrame::Audio(frame),
                        Err(e) => {
                            warn!("undecodable provider audio: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                        Ok(event) => ProviderFrame::Event(event),
                        Err(e) => {
                            warn!("undecodable provider event: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                        continue;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            // Dropping in_tx closes the stream toward the session
        });

        Ok(ProviderLink {
            to_provider: out_tx,
            from_provider: in_rx,
        })
    }
}

/// Remote duplex session: same contract as the local pipeline, with the
/// three stages living on the other side of a persistent connection.
pub struct ProviderSession {
    descriptor: SessionDescriptor,
    connector: Arc<dyn ProviderConnector>,
    outbound: Arc<FrameQueue>,
    to_provider: Mutex<Option<mpsc::Sender<ProviderOutbound>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    out_seq: Arc<AtomicU64>,
}

impl ProviderSession {
    pub fn new(
        descriptor: SessionDescriptor,
        connector: Arc<dyn ProviderConnector>,
        outbound: Arc<FrameQueue>,
    ) -> Self {
        debug_assert_eq!(descriptor.backend, BackendKind::Provider);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            descriptor,
            connector,
            outbound,
            to_provider: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            out_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<ProviderOutbound>, SessionError> {
        self.to_provider
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Unavailable("provider session not started".to_string()))
    }

    fn send_event(&self, event: ProviderClientEvent) -> Result<(), SessionError> {
        let sender = self.sender()?;
        sender
            .try_send(ProviderOutbound::Event(event))
            .map_err(|e| SessionError::Transport(format!("provider control channel: {e}")))
    }
}

#[async_trait]
impl VoiceSession for ProviderSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn start(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let link = self.connector.open(&self.descriptor).await?;
        *self.to_provider.lock() = Some(link.to_provider);

        self.send_event(ProviderClientEvent::Hello {
            session_id: self.descriptor.session_id.to_string(),
            call_id: self.descriptor.call_id.clone(),
            variant_id: self.descriptor.policy_variant_id.clone(),
        })?;

        tokio::spawn(pump_provider(
            link.from_provider,
            Arc::clone(&self.outbound),
            Arc::clone(&self.out_seq),
            self.events_tx.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), SessionError> {
        self.send_event(ProviderClientEvent::Speak {
            text: text.to_string(),
        })
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let sender = self.sender()?;
        match sender.try_send(ProviderOutbound::Audio(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The uplink is the backpressure boundary; dropping here
                // mirrors the frame bus eviction policy
                debug!("provider uplink full, frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Transport(
                "provider connection lost".to_string(),
            )),
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    async fn stop_output(&self) -> Result<(), SessionError> {
        let result = self.send_event(ProviderClientEvent::BargeIn { ts_ms: now_ms() });
        self.outbound.keep_front(BARGE_IN_KEEP_FRAMES);
        emit(
            &self.events_tx,
            SessionEvent::OutputStopped { ts_ms: now_ms() },
        );
        result
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Best effort: the connection may already be gone
        let _ = self.send_event(ProviderClientEvent::Bye);
        *self.to_provider.lock() = None;
        self.cancel.cancel();
        emit(&self.events_tx, SessionEvent::Closed);
        Ok(())
    }
}

fn error_kind_from_code(code: &str) -> ErrorKind {
    match code {
        "backend_unavailable" => ErrorKind::BackendUnavailable,
        "backend_timeout" => ErrorKind::BackendTimeout,
        "rate_limited" => ErrorKind::RateLimited,
        "auth" => ErrorKind::Auth,
        _ => ErrorKind::Internal,
    }
}

/// Map the provider stream onto session events and the outbound queue.
async fn pump_provider(
    mut from_provider: mpsc::Receiver<ProviderFrame>,
    outbound: Arc<FrameQueue>,
    out_seq: Arc<AtomicU64>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut awaiting_first_audio: Option<Instant> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = from_provider.recv() => frame,
        };
        match frame {
            Some(ProviderFrame::Audio(remote)) => {
                // Renumber locally so outbound seq stays monotone across
                // failover even if the remote restarts its counter
                let seq = out_seq.fetch_add(1, Ordering::Relaxed);
                let ts_ms = remote.ts_ms;
                outbound.push(AudioFrame::new(seq, ts_ms, remote.pcm));
                if let Some(since) = awaiting_first_audio.take() {
                    let latency_ms = since.elapsed().as_millis() as u64;
                    crate::metrics::record_first_audio_latency(latency_ms as f64 / 1000.0);
                    emit(&events_tx, SessionEvent::FirstAudio { ts_ms, latency_ms });
                }
            }
            Some(ProviderFrame::Event(event)) => match event {
                ProviderServerEvent::UserSpeakingStart { ts_ms } => {
                    emit(&events_tx, SessionEvent::UserSpeakingStart { ts_ms });
                }
                ProviderServerEvent::UserSpeakingEnd { ts_ms } => {
                    awaiting_first_audio = Some(Instant::now());
                    emit(&events_tx, SessionEvent::UserSpeakingEnd { ts_ms });
                }
                ProviderServerEvent::SttPartial { text, ts_ms } => {
                    emit(&events_tx, SessionEvent::SttPartial { text, ts_ms });
                }
                ProviderServerEvent::SttFinal { text, ts_ms } => {
                    emit(&events_tx, SessionEvent::SttFinal { text, ts_ms });
                }
                ProviderServerEvent::LlmToken { text, ts_ms } => {
                    emit(&events_tx, SessionEvent::LlmToken { text, ts_ms });
                }
                ProviderServerEvent::TurnEnd {
                    turn_id,
                    durations_ms,
                } => {
                    awaiting_first_audio = None;
                    emit(
                        &events_tx,
                        SessionEvent::TurnEnded {
                            turn_id,
                            durations: durations_ms,
                        },
                    );
                }
                ProviderServerEvent::Error { code, message } => {
                    emit(
                        &events_tx,
                        SessionEvent::Error {
                            kind: error_kind_from_code(&code),
                            message,
                        },
                    );
                }
            },
            None => {
                emit(
                    &events_tx,
                    SessionEvent::Error {
                        kind: ErrorKind::BackendUnavailable,
                        message: "provider stream closed".to_string(),
                    },
                );
                return;
            }
        }
    }
}
