use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::CallContext;
use super::reward::RewardCalculator;
use crate::core::audio::{AudioFrame, FrameBus};
use crate::core::feedback::{FeedbackEvent, FeedbackStore, RewardOutbox};
use crate::core::policy::{DeployGate, PolicyCatalog};
use crate::core::session::{
    FailoverConfig, FailoverSession, SessionEvent, SessionFactory, TurnDurations, VoiceSession,
};
use crate::errors::ErrorKind;

/// Phrase spoken when a call must close on an error while the session can
/// still synthesize.
const APOLOGY_PHRASE: &str =
    "I am sorry, we are having technical difficulties. Please call again later.";

/// Per-call state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Answered,
    Listening,
    Speaking,
    Closing,
    Ended,
}

/// Inputs funneled into the state machine from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    IncomingCall,
    CallAnswered,
    /// Client-signaled barge-in (in addition to VAD detection).
    ClientBargeIn {
        ts_ms: u64,
    },
    /// Orderly goodbye, optionally carrying end-of-call feedback.
    ClientBye {
        resolution: Option<bool>,
        user_rating: Option<u8>,
    },
    /// Transport dropped.
    Hangup,
}

/// Outputs relayed to the client as typed messages.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    SttPartial { text: String, ts_ms: u64 },
    SttFinal { text: String, ts_ms: u64 },
    LlmToken { text: String, ts_ms: u64 },
    TurnEnd { turn_id: u32, durations: TurnDurations },
    BargeInAck { ts_ms: u64 },
    Error { kind: ErrorKind, message: String },
    Ended { cause: String },
}

/// Timer budgets of the state machine.
#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub ring_timeout: Duration,
    pub greeting_timeout: Duration,
    /// Watchdog from end of user speech to the first reply token; firing
    /// counts as an error signal toward failover.
    pub first_token_timeout: Duration,
    pub speaking_timeout: Duration,
    pub listening_idle_timeout: Duration,
    /// Budget for the goodbye/apology phrase while closing.
    pub closing_grace: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            greeting_timeout: Duration::from_secs(5),
            first_token_timeout: Duration::from_secs(1),
            speaking_timeout: Duration::from_secs(30),
            listening_idle_timeout: Duration::from_secs(10),
            closing_grace: Duration::from_secs(1),
        }
    }
}

/// Shared collaborators a call needs; built once per process and cloned
/// per call.
#[derive(Clone)]
pub struct CallDeps {
    pub deploy: Arc<DeployGate>,
    pub feedback: Arc<FeedbackStore>,
    pub outbox: Arc<RewardOutbox>,
    pub reward: RewardCalculator,
    pub catalog: Arc<PolicyCatalog>,
    pub factory: Arc<dyn SessionFactory>,
    pub failover: FailoverConfig,
    pub fsm: FsmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateTimer {
    Ring,
    Greeting,
    Speaking,
    Idle,
}

enum Wake {
    Input(Option<CallInput>),
    Frame(AudioFrame),
    Session(Option<SessionEvent>),
    StateTimer,
    Watchdog,
}

/// One call's finite-state machine.
///
/// Single logical writer: inbound audio, session events and timers are
/// merged into one loop, so state transitions never race. The FSM owns the
/// session exclusively and the cancellation token that tears it down.
pub struct CallFsm {
    state: CallState,
    ctx: CallContext,
    deps: CallDeps,
    bus: FrameBus,
    session: Option<Arc<FailoverSession>>,
    session_events: Option<mpsc::Receiver<SessionEvent>>,
    cancel: CancellationToken,
    outputs: mpsc::Sender<CallOutput>,
    state_timer: Option<(StateTimer, Instant)>,
    watchdog_at: Option<Instant>,
    user_speaking: bool,
    feedback_recorded: bool,
}

impl CallFsm {
    pub fn new(
        deps: CallDeps,
        call_id: &str,
        profile: &str,
        bus: FrameBus,
        outputs: mpsc::Sender<CallOutput>,
    ) -> Self {
        Self {
            state: CallState::Idle,
            ctx: CallContext::new(call_id, profile),
            deps,
            bus,
            session: None,
            session_events: None,
            cancel: CancellationToken::new(),
            outputs,
            state_timer: None,
            watchdog_at: None,
            user_speaking: false,
            feedback_recorded: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Sticky VAD flag: whether the caller is currently speaking.
    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the call to completion. Returns the finished machine so
    /// callers can inspect the terminal state and accumulated signals.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<CallInput>) -> CallFsm {
        while self.state != CallState::Ended {
            let wake = {
                let inbound = Arc::clone(&self.bus.inbound);
                let feed_frames = self.session.is_some()
                    && matches!(
                        self.state,
                        CallState::Answered | CallState::Listening | CallState::Speaking
                    );
                let state_deadline = self.state_timer.map(|(_, at)| at);
                let watchdog_at = self.watchdog_at;
                let session_rx = self.session_events.as_mut();

                tokio::select! {
                    input = inputs.recv() => Wake::Input(input),
                    frame = inbound.recv(), if feed_frames => Wake::Frame(frame),
                    event = recv_or_pending(session_rx) => Wake::Session(event),
                    _ = sleep_until_opt(state_deadline), if state_deadline.is_some() => {
                        Wake::StateTimer
                    }
                    _ = sleep_until_opt(watchdog_at), if watchdog_at.is_some() => Wake::Watchdog,
                }
            };

            match wake {
                Wake::Input(Some(input)) => self.handle_input(input).await,
                Wake::Input(None) => self.handle_input(CallInput::Hangup).await,
                Wake::Frame(frame) => self.on_frame(frame).await,
                Wake::Session(Some(event)) => self.on_session_event(event).await,
                Wake::Session(None) => {
                    self.session_events = None;
                    self.enter_closing("session_gone").await;
                }
                Wake::StateTimer => self.on_state_timer().await,
                Wake::Watchdog => self.on_watchdog().await,
            }
        }
        self
    }

    fn transition(&mut self, to: CallState) {
        debug!(call = %self.ctx.call_id, from = ?self.state, to = ?to, "fsm transition");
        self.state = to;
    }

    fn arm_state_timer(&mut self, kind: StateTimer, after: Duration) {
        self.state_timer = Some((kind, Instant::now() + after));
    }

    async fn handle_input(&mut self, input: CallInput) {
        match input {
            CallInput::IncomingCall => {
                if self.state == CallState::Idle {
                    self.transition(CallState::Ringing);
                    self.arm_state_timer(StateTimer::Ring, self.deps.fsm.ring_timeout);
                }
            }
            CallInput::CallAnswered => {
                if self.state == CallState::Ringing {
                    self.answer().await;
                }
            }
            CallInput::ClientBargeIn { ts_ms } => {
                if self.state == CallState::Speaking {
                    self.barge_in(ts_ms).await;
                }
            }
            CallInput::ClientBye {
                resolution,
                user_rating,
            } => {
                if let Some(resolution) = resolution {
                    self.ctx.signals.resolution = resolution;
                }
                if let Some(rating) = user_rating {
                    self.ctx.signals.user_rating = Some(rating.clamp(1, 5));
                }
                self.enter_closing("bye").await;
            }
            CallInput::Hangup => self.enter_closing("hangup").await,
        }
    }

    /// The RINGING -> ANSWERED transition: pick the policy variant (exactly
    /// once per call), build the session through the failover controller
    /// and open with the variant's greeting.
    async fn answer(&mut self) {
        let variant_id = self.deps.deploy.select_variant();
        self.ctx.policy_variant_id = Some(variant_id.clone());

        let session = match FailoverSession::open(
            self.deps.failover.clone(),
            Arc::clone(&self.deps.factory),
            &self.ctx.call_id,
            &variant_id,
            Arc::clone(&self.bus.outbound),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(call = %self.ctx.call_id, "no session backend available: {e}");
                self.send_output(CallOutput::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                // Never answered: terminate without a feedback record
                self.state_timer = None;
                self.transition(CallState::Ended);
                self.send_output(CallOutput::Ended {
                    cause: "no_backend".to_string(),
                });
                return;
            }
        };

        self.session_events = session.take_events();
        self.ctx.answered_at = Some(std::time::Instant::now());
        crate::metrics::record_call_started();

        let greeting = self
            .deps
            .catalog
            .get(&variant_id)
            .map(|v| v.parameters.greeting.clone())
            .unwrap_or_else(|| "Hello, how can I help you?".to_string());
        if let Err(e) = session.speak(&greeting).await {
            warn!(call = %self.ctx.call_id, "greeting failed: {e}");
        }

        self.session = Some(session);
        self.transition(CallState::Answered);
        self.arm_state_timer(StateTimer::Greeting, self.deps.fsm.greeting_timeout);
        info!(call = %self.ctx.call_id, variant = %variant_id, "call answered");
    }

    async fn on_frame(&mut self, frame: AudioFrame) {
        if let Some(session) = &self.session {
            // Failover swallows recoverable errors; anything else comes
            // back through the event stream
            let _ = session.push_frame(frame).await;
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::UserSpeakingStart { ts_ms } => {
                self.user_speaking = true;
                match self.state {
                    // Speaking over the assistant, greeting included, is a
                    // barge-in
                    CallState::Speaking | CallState::Answered => self.barge_in(ts_ms).await,
                    CallState::Listening => {
                        // User is talking again: hold the idle timer
                        self.state_timer = None;
                    }
                    _ => {}
                }
            }
            SessionEvent::UserSpeakingEnd { .. } => {
                self.user_speaking = false;
                if self.state == CallState::Listening {
                    self.transition(CallState::Speaking);
                    self.watchdog_at =
                        Some(Instant::now() + self.deps.fsm.first_token_timeout);
                    self.arm_state_timer(StateTimer::Speaking, self.deps.fsm.speaking_timeout);
                }
            }
            SessionEvent::SttPartial { text, ts_ms } => {
                self.send_output(CallOutput::SttPartial { text, ts_ms });
            }
            SessionEvent::SttFinal { text, ts_ms } => {
                self.ctx.note_transcript(&text);
                self.send_output(CallOutput::SttFinal { text, ts_ms });
            }
            SessionEvent::LlmToken { text, ts_ms } => {
                // First token arrived: the watchdog stands down
                self.watchdog_at = None;
                self.send_output(CallOutput::LlmToken { text, ts_ms });
            }
            SessionEvent::FirstAudio { .. } => {
                // Latency is recorded at the session; state is unchanged
            }
            SessionEvent::OutputStopped { .. } => {}
            SessionEvent::TurnEnded { turn_id, durations } => match self.state {
                CallState::Answered => {
                    // Greeting spoken
                    self.transition(CallState::Listening);
                    self.arm_state_timer(StateTimer::Idle, self.deps.fsm.listening_idle_timeout);
                }
                CallState::Speaking => {
                    self.watchdog_at = None;
                    self.transition(CallState::Listening);
                    self.arm_state_timer(StateTimer::Idle, self.deps.fsm.listening_idle_timeout);
                    self.send_output(CallOutput::TurnEnd { turn_id, durations });
                }
                _ => {}
            },
            SessionEvent::Error { kind, message } => {
                warn!(call = %self.ctx.call_id, code = kind.code(), "session error: {message}");
                self.send_output(CallOutput::Error {
                    kind,
                    message: message.clone(),
                });
                self.enter_closing(kind.code()).await;
            }
            SessionEvent::Closed => {
                if self.state != CallState::Closing {
                    self.enter_closing("session_closed").await;
                }
            }
        }
    }

    /// Barge-in: the user spoke over the assistant. Output must be silenced
    /// within 120 ms of the triggering frame; a new user turn begins.
    async fn barge_in(&mut self, ts_ms: u64) {
        self.ctx.signals.barge_in_count += 1;
        let stop_started = std::time::Instant::now();
        if let Some(session) = &self.session {
            if let Err(e) = session.stop_output().await {
                warn!(call = %self.ctx.call_id, "stop_output failed: {e}");
            }
        }
        crate::metrics::record_barge_in_latency(stop_started.elapsed().as_secs_f64());

        self.user_speaking = true;
        self.watchdog_at = None;
        self.transition(CallState::Listening);
        // User is mid-utterance; no idle timer until their turn ends
        self.state_timer = None;
        self.send_output(CallOutput::BargeInAck { ts_ms });
    }

    async fn on_state_timer(&mut self) {
        let Some((kind, _)) = self.state_timer.take() else {
            return;
        };
        match kind {
            StateTimer::Ring => self.enter_closing("ring_timeout").await,
            StateTimer::Greeting => self.enter_closing("greeting_timeout").await,
            StateTimer::Speaking => self.enter_closing("turn_timeout").await,
            StateTimer::Idle => self.enter_closing("idle_timeout").await,
        }
    }

    /// First-token watchdog: no reply token within budget counts as an
    /// error signal toward failover; the turn itself keeps its 30 s budget.
    async fn on_watchdog(&mut self) {
        self.watchdog_at = None;
        if self.state == CallState::Speaking {
            if let Some(session) = &self.session {
                debug!(call = %self.ctx.call_id, "first-token watchdog fired");
                session.report_backend_timeout().await;
            }
        }
    }

    async fn enter_closing(&mut self, cause: &str) {
        if matches!(self.state, CallState::Closing | CallState::Ended) {
            return;
        }
        let was_answered = self.ctx.answered_at.is_some();
        info!(call = %self.ctx.call_id, cause, "call closing");
        self.transition(CallState::Closing);
        self.state_timer = None;
        self.watchdog_at = None;

        if let Some(session) = self.session.take() {
            // On error causes, say goodbye while the session still can
            let is_error_cause = !matches!(cause, "bye" | "hangup");
            if was_answered && is_error_cause {
                let _ = tokio::time::timeout(
                    self.deps.fsm.closing_grace,
                    session.speak(APOLOGY_PHRASE),
                )
                .await;
            }
            self.cancel.cancel();
            let _ = session.close().await;
        } else {
            self.cancel.cancel();
        }
        self.session_events = None;

        if was_answered {
            self.finalize_feedback().await;
            crate::metrics::record_call_ended();
        }

        self.transition(CallState::Ended);
        self.send_output(CallOutput::Ended {
            cause: cause.to_string(),
        });
    }

    /// Record exactly one feedback event for an answered call and feed the
    /// reward to the deploy gate.
    async fn finalize_feedback(&mut self) {
        if self.feedback_recorded {
            return;
        }
        self.feedback_recorded = true;

        let signals = self.ctx.feedback_signals();
        let reward = self.deps.reward.reward(&signals);
        let variant_id = self
            .ctx
            .policy_variant_id
            .clone()
            .unwrap_or_else(|| self.deps.deploy.base_variant_id().to_string());
        let now_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let event = FeedbackEvent::anonymized(
            &self.ctx.call_id,
            now_s,
            &self.ctx.profile,
            &variant_id,
            signals,
        );
        if let Err(e) = self.deps.feedback.append(&event).await {
            warn!(call = %self.ctx.call_id, "feedback append failed: {e}");
        }

        if let Err(e) = self.deps.deploy.record_feedback(&variant_id, reward).await {
            // The in-memory update succeeded; only durability is pending
            warn!(variant = %variant_id, "deploy persistence failed, reward parked: {e}");
            self.deps.outbox.park(variant_id, reward);
        }
        info!(call = %self.ctx.call_id, reward, "feedback recorded");
    }

    fn send_output(&self, output: CallOutput) {
        if let Err(e) = self.outputs.try_send(output) {
            debug!("call output dropped: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &CallContext {
        &self.ctx
    }
}

async fn recv_or_pending(rx: Option<&mut mpsc::Receiver<SessionEvent>>) -> Option<SessionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
