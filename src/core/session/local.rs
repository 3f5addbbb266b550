use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backends::{LlmEngine, SttEngine, TtsEngine};
use super::{
    emit, BackendKind, SessionDescriptor, SessionError, SessionEvent, TurnDurations, VoiceSession,
    EVENT_CHANNEL_CAPACITY,
};
use crate::core::audio::{AudioFrame, FrameQueue, FRAME_DURATION_MS, SAMPLE_RATE_HZ};
use crate::core::vad::{SpeechTracker, VadConfig, VadEvent};

/// Frames of already-queued audio allowed to play out after barge-in
/// (2 x 20 ms = the 40 ms the contract permits).
const BARGE_IN_KEEP_FRAMES: usize = 2;

/// Pre-roll kept while the user is silent, so the first syllables of the
/// next utterance are not lost to the VAD debounce.
const PREROLL_SAMPLES: usize = (SAMPLE_RATE_HZ as usize) / 2;

/// Hard cap on captured audio per turn.
const MAX_CAPTURE_SAMPLES: usize = (SAMPLE_RATE_HZ as usize) * 30;

/// Configuration of the in-process pipeline session.
#[derive(Debug, Clone, Default)]
pub struct LocalSessionConfig {
    pub vad: VadConfig,
}

impl LocalSessionConfig {
    /// Derive the VAD behavior from the variant's barge-in sensitivity.
    pub fn for_sensitivity(sensitivity: f32) -> Self {
        Self {
            vad: VadConfig::for_sensitivity(sensitivity),
        }
    }
}

struct TurnState {
    captured: Vec<i16>,
    /// Cancellation token of the currently speaking turn, if any.
    active: Option<(u32, CancellationToken)>,
}

/// In-process voice session: VAD-triggered STT, streamed LLM reply, and
/// incremental TTS onto the outbound queue, in a single-writer loop driven
/// by `push_frame`.
pub struct LocalSession {
    descriptor: SessionDescriptor,
    config: LocalSessionConfig,
    outbound: Arc<FrameQueue>,
    stt: Arc<dyn SttEngine>,
    llm: Arc<dyn LlmEngine>,
    tts: Arc<dyn TtsEngine>,
    vad: SpeechTracker,
    state: Arc<Mutex<TurnState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    out_seq: Arc<AtomicU64>,
    turn_counter: AtomicU32,
}

impl LocalSession {
    pub fn new(
        descriptor: SessionDescriptor,
        config: LocalSessionConfig,
        outbound: Arc<FrameQueue>,
        stt: Arc<dyn SttEngine>,
        llm: Arc<dyn LlmEngine>,
        tts: Arc<dyn TtsEngine>,
    ) -> Self {
        debug_assert_eq!(descriptor.backend, BackendKind::Local);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let vad = SpeechTracker::new(config.vad);
        Self {
            descriptor,
            config,
            outbound,
            stt,
            llm,
            tts,
            vad,
            state: Arc::new(Mutex::new(TurnState {
                captured: Vec::new(),
                active: None,
            })),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            out_seq: Arc::new(AtomicU64::new(0)),
            turn_counter: AtomicU32::new(0),
        }
    }

    fn next_turn_id(&self) -> u32 {
        self.turn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn config(&self) -> &LocalSessionConfig {
        &self.config
    }

    /// Stop the active turn's synthesis and flush queued output down to the
    /// barge-in allowance. Returns whether a turn was actually stopped.
    fn interrupt_output(&self) -> bool {
        let stopped = {
            let mut state = self.state.lock();
            match state.active.take() {
                Some((turn_id, token)) => {
                    token.cancel();
                    debug!(turn_id, "turn cancelled on barge-in");
                    true
                }
                None => false,
            }
        };
        let flushed = self.outbound.keep_front(BARGE_IN_KEEP_FRAMES);
        if flushed > 0 {
            debug!(flushed, "outbound flushed to barge-in allowance");
        }
        stopped
    }

    fn spawn_turn(&self, transcript_pcm: Vec<i16>, speech_end: Instant) {
        let turn_id = self.next_turn_id();
        let turn_cancel = self.cancel.child_token();
        self.state.lock().active = Some((turn_id, turn_cancel.clone()));

        let ctx = TurnCtx {
            turn_id,
            cancel: turn_cancel,
            stt: Arc::clone(&self.stt),
            llm: Arc::clone(&self.llm),
            tts: Arc::clone(&self.tts),
            outbound: Arc::clone(&self.outbound),
            out_seq: Arc::clone(&self.out_seq),
            events_tx: self.events_tx.clone(),
            state: Arc::clone(&self.state),
        };
        tokio::spawn(run_turn(ctx, transcript_pcm, speech_end));
    }
}

#[async_trait]
impl VoiceSession for LocalSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn start(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let turn_id = self.next_turn_id();
        let turn_cancel = self.cancel.child_token();
        self.state.lock().active = Some((turn_id, turn_cancel.clone()));

        let ctx = TurnCtx {
            turn_id,
            cancel: turn_cancel,
            stt: Arc::clone(&self.stt),
            llm: Arc::clone(&self.llm),
            tts: Arc::clone(&self.tts),
            outbound: Arc::clone(&self.outbound),
            out_seq: Arc::clone(&self.out_seq),
            events_tx: self.events_tx.clone(),
            state: Arc::clone(&self.state),
        };
        let text = text.to_string();
        tokio::spawn(run_scripted_turn(ctx, text));
        Ok(())
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if !frame.is_well_formed() {
            return Err(SessionError::Internal("malformed frame payload".to_string()));
        }

        // Capture first so the confirming frames of a speech onset are part
        // of the utterance.
        {
            let mut state = self.state.lock();
            state.captured.extend_from_slice(&frame.samples());
            if !self.vad.is_speaking() && state.captured.len() > PREROLL_SAMPLES {
                let excess = state.captured.len() - PREROLL_SAMPLES;
                state.captured.drain(..excess);
            }
            if state.captured.len() > MAX_CAPTURE_SAMPLES {
                let excess = state.captured.len() - MAX_CAPTURE_SAMPLES;
                state.captured.drain(..excess);
            }
        }

        match self.vad.process(&frame) {
            Some(VadEvent::SpeechStart) => {
                emit(
                    &self.events_tx,
                    SessionEvent::UserSpeakingStart {
                        ts_ms: self.vad.speech_start_ts_ms(),
                    },
                );
                // Speaking over the assistant interrupts it right here, on
                // the same frame that confirmed the speech onset.
                if self.interrupt_output() {
                    emit(
                        &self.events_tx,
                        SessionEvent::OutputStopped { ts_ms: frame.ts_ms },
                    );
                }
            }
            Some(VadEvent::TurnEnd) => {
                emit(
                    &self.events_tx,
                    SessionEvent::UserSpeakingEnd { ts_ms: frame.ts_ms },
                );
                let captured = {
                    let mut state = self.state.lock();
                    std::mem::take(&mut state.captured)
                };
                self.vad.reset();
                if captured.is_empty() {
                    warn!("turn end with empty capture, skipping");
                } else {
                    self.spawn_turn(captured, Instant::now());
                }
            }
            Some(VadEvent::SilenceDetected) | Some(VadEvent::SpeechResumed) | None => {}
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    async fn stop_output(&self) -> Result<(), SessionError> {
        self.interrupt_output();
        emit(
            &self.events_tx,
            SessionEvent::OutputStopped {
                ts_ms: super::now_ms(),
            },
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        self.state.lock().active = None;
        emit(&self.events_tx, SessionEvent::Closed);
        Ok(())
    }
}

/// Everything a turn task needs, detached from the session borrow.
struct TurnCtx {
    turn_id: u32,
    cancel: CancellationToken,
    stt: Arc<dyn SttEngine>,
    llm: Arc<dyn LlmEngine>,
    tts: Arc<dyn TtsEngine>,
    outbound: Arc<FrameQueue>,
    out_seq: Arc<AtomicU64>,
    events_tx: mpsc::Sender<SessionEvent>,
    state: Arc<Mutex<TurnState>>,
}

impl TurnCtx {
    fn finish(&self) {
        let mut state = self.state.lock();
        if matches!(state.active, Some((id, _)) if id == self.turn_id) {
            state.active = None;
        }
    }
}

/// Full STT -> LLM -> TTS turn, triggered by the end of user speech.
async fn run_turn(ctx: TurnCtx, pcm: Vec<i16>, speech_end: Instant) {
    let turn_start = Instant::now();

    // STT with partial forwarding
    let (partial_tx, mut partial_rx) = mpsc::channel::<String>(16);
    let partial_events = ctx.events_tx.clone();
    let partial_task = tokio::spawn(async move {
        while let Some(text) = partial_rx.recv().await {
            emit(
                &partial_events,
                SessionEvent::SttPartial {
                    text,
                    ts_ms: super::now_ms(),
                },
            );
        }
    });

    let stt_started = Instant::now();
    let transcript = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            ctx.finish();
            return;
        }
        result = ctx.stt.transcribe(pcm, partial_tx) => match result {
            Ok(t) => t,
            Err(e) => {
                let e: SessionError = e.into();
                emit(&ctx.events_tx, SessionEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                ctx.finish();
                return;
            }
        }
    };
    let stt_ms = stt_started.elapsed().as_millis() as u64;
    let _ = partial_task.await;

    emit(
        &ctx.events_tx,
        SessionEvent::SttFinal {
            text: transcript.text.clone(),
            ts_ms: super::now_ms(),
        },
    );

    // LLM token stream
    let llm_started = Instant::now();
    let mut tokens = match ctx.llm.stream_reply(&transcript.text).await {
        Ok(rx) => rx,
        Err(e) => {
            let e: SessionError = e.into();
            emit(&ctx.events_tx, SessionEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
            ctx.finish();
            return;
        }
    };

    // TTS and the outbound pacer run concurrently with token arrival
    let (tts_token_tx, tts_token_rx) = mpsc::channel::<String>(64);
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(64);

    let tts_started = Instant::now();
    let tts_task = {
        let tts = Arc::clone(&ctx.tts);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move { tts.synthesize(tts_token_rx, frame_tx, cancel).await })
    };
    let pacer_task = tokio::spawn(pace_outbound(
        frame_rx,
        Arc::clone(&ctx.outbound),
        Arc::clone(&ctx.out_seq),
        ctx.events_tx.clone(),
        ctx.cancel.clone(),
        speech_end,
    ));

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            token = tokens.recv() => match token {
                Some(token) => {
                    emit(&ctx.events_tx, SessionEvent::LlmToken {
                        text: token.clone(),
                        ts_ms: super::now_ms(),
                    });
                    if tts_token_tx.send(token).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let llm_ms = llm_started.elapsed().as_millis() as u64;
    drop(tts_token_tx);

    if let Ok(Err(e)) = tts_task.await {
        let e: SessionError = e.into();
        emit(&ctx.events_tx, SessionEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        });
    }
    let tts_ms = tts_started.elapsed().as_millis() as u64;
    let _ = pacer_task.await;

    if !ctx.cancel.is_cancelled() {
        emit(
            &ctx.events_tx,
            SessionEvent::TurnEnded {
                turn_id: ctx.turn_id,
                durations: TurnDurations {
                    stt: stt_ms,
                    llm: llm_ms,
                    tts: tts_ms,
                    e2e: turn_start.elapsed().as_millis() as u64,
                },
            },
        );
    }
    ctx.finish();
}

/// TTS-only turn for scripted phrases (greeting, apology).
async fn run_scripted_turn(ctx: TurnCtx, text: String) {
    let turn_start = Instant::now();

    let (tts_token_tx, tts_token_rx) = mpsc::channel::<String>(64);
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(64);

    let tts_task = {
        let tts = Arc::clone(&ctx.tts);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move { tts.synthesize(tts_token_rx, frame_tx, cancel).await })
    };
    let pacer_task = tokio::spawn(pace_outbound(
        frame_rx,
        Arc::clone(&ctx.outbound),
        Arc::clone(&ctx.out_seq),
        ctx.events_tx.clone(),
        ctx.cancel.clone(),
        turn_start,
    ));

    for word in text.split_whitespace() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if tts_token_tx.send(format!("{word} ")).await.is_err() {
            break;
        }
    }
    drop(tts_token_tx);

    if let Ok(Err(e)) = tts_task.await {
        let e: SessionError = e.into();
        emit(&ctx.events_tx, SessionEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        });
    }
    let _ = pacer_task.await;

    if !ctx.cancel.is_cancelled() {
        let total = turn_start.elapsed().as_millis() as u64;
        emit(
            &ctx.events_tx,
            SessionEvent::TurnEnded {
                turn_id: ctx.turn_id,
                durations: TurnDurations {
                    stt: 0,
                    llm: 0,
                    tts: total,
                    e2e: total,
                },
            },
        );
    }
    ctx.finish();
}

/// Push synthesized payloads onto the outbound queue at frame cadence.
async fn pace_outbound(
    mut frame_rx: mpsc::Receiver<Bytes>,
    outbound: Arc<FrameQueue>,
    out_seq: Arc<AtomicU64>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    speech_end: Instant,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FRAME_DURATION_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut first = true;

    loop {
        let pcm = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = frame_rx.recv() => match chunk {
                Some(pcm) => pcm,
                None => break,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let seq = out_seq.fetch_add(1, Ordering::Relaxed);
        let ts_ms = super::now_ms();
        outbound.push(AudioFrame::new(seq, ts_ms, pcm));
        if first {
            first = false;
            let latency_ms = speech_end.elapsed().as_millis() as u64;
            crate::metrics::record_first_audio_latency(latency_ms as f64 / 1000.0);
            emit(&events_tx, SessionEvent::FirstAudio { ts_ms, latency_ms });
        }
    }
}
