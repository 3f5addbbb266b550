use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    emit, BackendKind, SessionDescriptor, SessionError, SessionEvent, VoiceSession,
    EVENT_CHANNEL_CAPACITY,
};
use crate::config::{BackendMode, ServerConfig};
use crate::core::audio::{AudioFrame, FrameQueue};
use crate::errors::ErrorKind;

/// Failover tuning, loaded from the server configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub policy: BackendMode,
    /// p95 end-to-end latency that arms a switch, milliseconds.
    pub trigger_ms: u64,
    /// Errors within the rolling window that trigger a switch.
    pub error_burst: u32,
    /// Rolling window for both error and latency health.
    pub error_window: Duration,
    /// How long degraded latency must persist before switching.
    pub latency_sustain: Duration,
    /// Re-switching is inhibited for this long after a switch.
    pub cooldown: Duration,
    /// Both sessions run during this window after a switch.
    pub handover_window: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            policy: BackendMode::ProviderThenLocal,
            trigger_ms: 800,
            error_burst: 3,
            error_window: Duration::from_secs(60),
            latency_sustain: Duration::from_secs(120),
            cooldown: Duration::from_secs(600),
            handover_window: Duration::from_millis(200),
        }
    }
}

impl FailoverConfig {
    pub fn from_server(config: &ServerConfig) -> Self {
        Self {
            policy: config.backend_mode,
            trigger_ms: config.fallback_trigger_ms,
            error_burst: config.fallback_error_burst,
            error_window: Duration::from_secs(config.fallback_error_window_s),
            cooldown: Duration::from_secs(config.fallback_cooldown_s),
            ..Default::default()
        }
    }

    fn primary(&self) -> BackendKind {
        match self.policy {
            BackendMode::ProviderOnly | BackendMode::ProviderThenLocal => BackendKind::Provider,
            BackendMode::LocalOnly | BackendMode::LocalThenProvider => BackendKind::Local,
        }
    }

    fn has_secondary(&self) -> bool {
        matches!(
            self.policy,
            BackendMode::ProviderThenLocal | BackendMode::LocalThenProvider
        )
    }
}

/// Controller lifecycle, exposed for status and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    PrimaryUp,
    Degraded,
    Switching,
    SecondaryUp,
}

/// Builds concrete sessions per backend; injectable for tests.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn build(
        &self,
        kind: BackendKind,
        descriptor: SessionDescriptor,
        outbound: Arc<FrameQueue>,
    ) -> Result<Arc<dyn VoiceSession>, SessionError>;
}

/// Rolling health over one backend's recent behavior.
struct HealthWindow {
    latencies: VecDeque<(Instant, u64)>,
    errors: VecDeque<Instant>,
    degraded_since: Option<Instant>,
}

impl HealthWindow {
    fn new() -> Self {
        Self {
            latencies: VecDeque::new(),
            errors: VecDeque::new(),
            degraded_since: None,
        }
    }

    fn record_latency(&mut self, now: Instant, ms: u64, window: Duration) {
        self.latencies.push_back((now, ms));
        while matches!(self.latencies.front(), Some((t, _)) if now.duration_since(*t) > window) {
            self.latencies.pop_front();
        }
    }

    fn p95(&self) -> Option<u64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies.iter().map(|(_, ms)| *ms).collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    fn record_error(&mut self, now: Instant, window: Duration) -> usize {
        self.errors.push_back(now);
        while matches!(self.errors.front(), Some(t) if now.duration_since(*t) > window) {
            self.errors.pop_front();
        }
        self.errors.len()
    }

    fn reset(&mut self) {
        self.latencies.clear();
        self.errors.clear();
        self.degraded_since = None;
    }
}

/// One session handle backed by a provider and/or local session.
///
/// Health degradation on the active backend opens the other one, pipes the
/// inbound stream across a short handover window, then terminates the old
/// session and enters a cooldown during which re-switching is inhibited.
/// When no alternative remains, the controller surfaces a terminal error.
pub struct FailoverSession {
    descriptor: SessionDescriptor,
    config: FailoverConfig,
    factory: Arc<dyn SessionFactory>,
    outbound: Arc<FrameQueue>,
    active: parking_lot::RwLock<Arc<dyn VoiceSession>>,
    /// Old session still fed during the handover window.
    shadow: Mutex<Option<(Arc<dyn VoiceSession>, Instant)>>,
    health: Mutex<HealthWindow>,
    state: Mutex<FailoverState>,
    cooldown_until: Mutex<Option<Instant>>,
    switching: AtomicBool,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// Back-reference for tasks spawned after construction.
    self_ref: Mutex<Weak<FailoverSession>>,
}

impl FailoverSession {
    /// Open the primary backend (falling back to the secondary right away
    /// if the primary cannot start) and return the composite handle.
    pub async fn open(
        config: FailoverConfig,
        factory: Arc<dyn SessionFactory>,
        call_id: &str,
        policy_variant_id: &str,
        outbound: Arc<FrameQueue>,
    ) -> Result<Arc<Self>, SessionError> {
        let primary_kind = config.primary();
        let descriptor = SessionDescriptor::new(call_id, policy_variant_id, primary_kind);

        let (first, state) = match factory
            .build(primary_kind, descriptor.clone(), Arc::clone(&outbound))
            .await
        {
            Ok(session) => (session, FailoverState::PrimaryUp),
            Err(e) if config.has_secondary() => {
                warn!(backend = primary_kind.as_str(), "primary backend failed to build: {e}");
                crate::metrics::record_failover(
                    primary_kind.as_str(),
                    primary_kind.other().as_str(),
                );
                let session = factory
                    .build(
                        primary_kind.other(),
                        descriptor.for_backend(primary_kind.other()),
                        Arc::clone(&outbound),
                    )
                    .await?;
                (session, FailoverState::SecondaryUp)
            }
            Err(e) => return Err(e),
        };

        first.start().await?;
        let backend = first.descriptor().backend;
        crate::metrics::set_active_backend(backend.as_str(), true);
        crate::metrics::set_active_backend(backend.other().as_str(), false);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let controller = Arc::new(Self {
            descriptor,
            config,
            factory,
            outbound,
            active: parking_lot::RwLock::new(Arc::clone(&first)),
            shadow: Mutex::new(None),
            health: Mutex::new(HealthWindow::new()),
            state: Mutex::new(state),
            cooldown_until: Mutex::new(None),
            switching: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            self_ref: Mutex::new(Weak::new()),
        });
        *controller.self_ref.lock() = Arc::downgrade(&controller);

        controller.spawn_pump(&first);
        Ok(controller)
    }

    /// Backend currently serving the call.
    pub fn active_backend(&self) -> BackendKind {
        self.active.read().descriptor().backend
    }

    pub fn state(&self) -> FailoverState {
        *self.state.lock()
    }

    pub fn in_cooldown(&self) -> bool {
        matches!(*self.cooldown_until.lock(), Some(t) if Instant::now() < t)
    }

    /// External timeout signal (e.g. the first-token watchdog): counts into
    /// the error window and may trigger a switch.
    pub async fn report_backend_timeout(&self) {
        self.note_error().await;
    }

    fn spawn_pump(&self, session: &Arc<dyn VoiceSession>) {
        let Some(rx) = session.take_events() else {
            warn!("session event stream already taken");
            return;
        };
        let Some(controller) = self.self_ref.lock().upgrade() else {
            return;
        };
        let backend = session.descriptor().backend;
        tokio::spawn(async move { controller.pump(rx, backend).await });
    }

    /// Forward one inner session's events, folding health into the window
    /// and swallowing backend errors the controller can still recover from.
    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<SessionEvent>, backend: BackendKind) {
        while let Some(event) = rx.recv().await {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            // Stale events from a replaced session are dropped
            if self.active_backend() != backend {
                continue;
            }
            match &event {
                SessionEvent::TurnEnded { durations, .. } => {
                    self.note_latency(durations.e2e).await;
                    emit(&self.events_tx, event);
                }
                SessionEvent::Error { kind, .. }
                    if matches!(
                        kind,
                        ErrorKind::BackendUnavailable | ErrorKind::BackendTimeout
                    ) =>
                {
                    if self.recovery_possible() {
                        self.note_error().await;
                    } else {
                        emit(&self.events_tx, event);
                    }
                }
                SessionEvent::Closed => {
                    // The composite handle reports Closed only when it
                    // closes itself
                }
                _ => emit(&self.events_tx, event),
            }
        }
    }

    fn recovery_possible(&self) -> bool {
        self.config.has_secondary() && !self.in_cooldown() && !self.closed.load(Ordering::Acquire)
    }

    async fn note_latency(&self, e2e_ms: u64) {
        let now = Instant::now();
        let should_switch = {
            let mut health = self.health.lock();
            health.record_latency(now, e2e_ms, self.config.error_window);
            match health.p95() {
                Some(p95) if p95 > self.config.trigger_ms => {
                    let since = *health.degraded_since.get_or_insert(now);
                    let sustained = now.duration_since(since) >= self.config.latency_sustain;
                    if !sustained {
                        let mut state = self.state.lock();
                        if *state == FailoverState::PrimaryUp {
                            *state = FailoverState::Degraded;
                        }
                    }
                    sustained
                }
                _ => {
                    health.degraded_since = None;
                    let mut state = self.state.lock();
                    if *state == FailoverState::Degraded {
                        *state = FailoverState::PrimaryUp;
                    }
                    false
                }
            }
        };
        if should_switch {
            self.try_switch("latency p95 over threshold").await;
        }
    }

    async fn note_error(&self) {
        let now = Instant::now();
        let count = self
            .health
            .lock()
            .record_error(now, self.config.error_window);
        if count >= self.config.error_burst as usize {
            self.try_switch("error burst").await;
        }
    }

    async fn try_switch(&self, reason: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.switching.swap(true, Ordering::AcqRel) {
            return;
        }
        self.do_switch(reason).await;
        self.switching.store(false, Ordering::Release);
    }

    async fn do_switch(&self, reason: &str) {
        if self.in_cooldown() {
            info!("failover inhibited by cooldown");
            return;
        }
        if !self.config.has_secondary() {
            self.surface_terminal("no alternative backend in policy");
            return;
        }

        let from = self.active_backend();
        let to = from.other();
        *self.state.lock() = FailoverState::Switching;
        info!(from = from.as_str(), to = to.as_str(), reason, "failover switch");

        let new_descriptor = self.descriptor.for_backend(to);
        let new_session = match self
            .factory
            .build(to, new_descriptor, Arc::clone(&self.outbound))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("secondary backend failed to build: {e}");
                self.surface_terminal("both backends unavailable");
                return;
            }
        };
        if let Err(e) = new_session.start().await {
            warn!("secondary backend failed to start: {e}");
            self.surface_terminal("both backends unavailable");
            return;
        }

        // From here the switch is committed
        let old = {
            let mut active = self.active.write();
            std::mem::replace(&mut *active, Arc::clone(&new_session))
        };
        *self.shadow.lock() = Some((
            Arc::clone(&old),
            Instant::now() + self.config.handover_window,
        ));
        *self.cooldown_until.lock() = Some(Instant::now() + self.config.cooldown);
        *self.state.lock() = FailoverState::SecondaryUp;
        self.health.lock().reset();

        crate::metrics::record_failover(from.as_str(), to.as_str());
        crate::metrics::set_active_backend(from.as_str(), false);
        crate::metrics::set_active_backend(to.as_str(), true);

        // Pump the new session's events; retire the old one after the
        // handover window
        self.spawn_pump(&new_session);
        let handover = self.config.handover_window;
        if let Some(controller) = self.self_ref.lock().upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(handover).await;
                let _ = old.close().await;
                *controller.shadow.lock() = None;
            });
        }
    }

    fn surface_terminal(&self, message: &str) {
        emit(
            &self.events_tx,
            SessionEvent::Error {
                kind: ErrorKind::Terminal,
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl VoiceSession for FailoverSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn start(&self) -> Result<(), SessionError> {
        // The inner session was started in open()
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), SessionError> {
        let active = Arc::clone(&*self.active.read());
        active.speak(text).await
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        // During the handover window the old session still receives the
        // stream, so whichever backend produces output first wins
        let shadow = {
            let guard = self.shadow.lock();
            match &*guard {
                Some((session, until)) if Instant::now() < *until => Some(Arc::clone(session)),
                _ => None,
            }
        };
        if let Some(old) = shadow {
            let _ = old.push_frame(frame.clone()).await;
        }

        let active = Arc::clone(&*self.active.read());
        match active.push_frame(frame).await {
            Ok(()) => Ok(()),
            Err(_) if self.recovery_possible() => {
                self.note_error().await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    async fn stop_output(&self) -> Result<(), SessionError> {
        let active = Arc::clone(&*self.active.read());
        active.stop_output().await
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let active = Arc::clone(&*self.active.read());
        let _ = active.close().await;
        let shadow = self.shadow.lock().take();
        if let Some((old, _)) = shadow {
            let _ = old.close().await;
        }
        crate::metrics::set_active_backend(BackendKind::Provider.as_str(), false);
        crate::metrics::set_active_backend(BackendKind::Local.as_str(), false);
        emit(&self.events_tx, SessionEvent::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Controllable inner session for failover tests.
    struct StubSession {
        descriptor: SessionDescriptor,
        events_tx: mpsc::Sender<SessionEvent>,
        events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
        pushed: Mutex<Vec<u64>>,
        closed: AtomicBool,
    }

    impl StubSession {
        fn new(descriptor: SessionDescriptor) -> Arc<Self> {
            let (events_tx, events_rx) = mpsc::channel(64);
            Arc::new(Self {
                descriptor,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                pushed: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn emit_error(&self, kind: ErrorKind) {
            let _ = self.events_tx.try_send(SessionEvent::Error {
                kind,
                message: "synthetic".to_string(),
            });
        }

        fn emit_turn(&self, e2e: u64) {
            let _ = self.events_tx.try_send(SessionEvent::TurnEnded {
                turn_id: 1,
                durations: super::super::TurnDurations {
                    stt: 0,
                    llm: 0,
                    tts: 0,
                    e2e,
                },
            });
        }
    }

    #[async_trait]
    impl VoiceSession for StubSession {
        fn descriptor(&self) -> &SessionDescriptor {
            &self.descriptor
        }
        async fn start(&self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn speak(&self, _text: &str) -> Result<(), SessionError> {
            Ok(())
        }
        async fn push_frame(&self, frame: AudioFrame) -> Result<(), SessionError> {
            self.pushed.lock().push(frame.seq);
            Ok(())
        }
        fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
            self.events_rx.lock().take()
        }
        async fn stop_output(&self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), SessionError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    struct StubFactory {
        fail: Mutex<HashMap<BackendKind, bool>>,
        built: Mutex<Vec<BackendKind>>,
        sessions: Mutex<HashMap<BackendKind, Arc<StubSession>>>,
    }

    impl StubFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: Mutex::new(HashMap::new()),
                built: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
            })
        }

        fn fail_backend(&self, kind: BackendKind) {
            self.fail.lock().insert(kind, true);
        }

        fn session(&self, kind: BackendKind) -> Arc<StubSession> {
            Arc::clone(self.sessions.lock().get(&kind).unwrap())
        }
    }

    #[async_trait]
    impl SessionFactory for StubFactory {
        async fn build(
            &self,
            kind: BackendKind,
            descriptor: SessionDescriptor,
            _outbound: Arc<FrameQueue>,
        ) -> Result<Arc<dyn VoiceSession>, SessionError> {
            self.built.lock().push(kind);
            if self.fail.lock().get(&kind).copied().unwrap_or(false) {
                return Err(SessionError::Unavailable("down".to_string()));
            }
            let session = StubSession::new(descriptor);
            self.sessions.lock().insert(kind, Arc::clone(&session));
            Ok(session)
        }
    }

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            policy: BackendMode::ProviderThenLocal,
            error_burst: 3,
            error_window: Duration::from_secs(60),
            latency_sustain: Duration::from_millis(50),
            cooldown: Duration::from_secs(600),
            handover_window: Duration::from_millis(40),
            ..Default::default()
        }
    }

    async fn open(
        config: FailoverConfig,
        factory: &Arc<StubFactory>,
    ) -> (Arc<FailoverSession>, mpsc::Receiver<SessionEvent>) {
        let outbound = Arc::new(FrameQueue::new(16, "outbound"));
        let controller = FailoverSession::open(
            config,
            Arc::clone(factory) as Arc<dyn SessionFactory>,
            "call-1",
            "v1a",
            outbound,
        )
        .await
        .unwrap();
        let events = controller.take_events().unwrap();
        (controller, events)
    }

    #[tokio::test]
    async fn test_primary_is_provider_under_default_policy() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        assert_eq!(controller.active_backend(), BackendKind::Provider);
        assert_eq!(controller.state(), FailoverState::PrimaryUp);
    }

    #[tokio::test]
    async fn test_error_burst_switches_to_local() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        // S2: three synthetic failures inside the window
        for _ in 0..3 {
            provider.emit_error(ErrorKind::BackendTimeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(controller.active_backend(), BackendKind::Local);
        assert_eq!(controller.state(), FailoverState::SecondaryUp);
        assert!(controller.in_cooldown());
        assert_eq!(
            factory.built.lock().as_slice(),
            &[BackendKind::Provider, BackendKind::Local]
        );
    }

    #[tokio::test]
    async fn test_cooldown_inhibits_re_switch() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        for _ in 0..3 {
            provider.emit_error(ErrorKind::BackendTimeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.active_backend(), BackendKind::Local);

        // More errors from the now-active local backend must not switch
        // back while the cooldown runs
        let local = factory.session(BackendKind::Local);
        for _ in 0..5 {
            local.emit_error(ErrorKind::BackendTimeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.active_backend(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_sustained_latency_triggers_switch() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        // p95 over the 800 ms trigger, sustained past latency_sustain
        for _ in 0..10 {
            provider.emit_turn(1500);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.active_backend(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_healthy_latency_stays_primary() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        for _ in 0..20 {
            provider.emit_turn(200);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.active_backend(), BackendKind::Provider);
        assert_eq!(controller.state(), FailoverState::PrimaryUp);
    }

    #[tokio::test]
    async fn test_primary_build_failure_opens_secondary() {
        let factory = StubFactory::new();
        factory.fail_backend(BackendKind::Provider);
        let (controller, _events) = open(fast_config(), &factory).await;
        assert_eq!(controller.active_backend(), BackendKind::Local);
        assert_eq!(controller.state(), FailoverState::SecondaryUp);
    }

    #[tokio::test]
    async fn test_both_backends_down_is_terminal() {
        let factory = StubFactory::new();
        let (controller, mut events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        // The local build will fail when the switch happens
        factory.fail_backend(BackendKind::Local);
        for _ in 0..3 {
            provider.emit_error(ErrorKind::BackendUnavailable);
        }

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Terminal),
            other => panic!("expected terminal error, got {other:?}"),
        }
        let _ = controller;
    }

    #[tokio::test]
    async fn test_single_backend_policy_surfaces_errors() {
        let factory = StubFactory::new();
        let config = FailoverConfig {
            policy: BackendMode::ProviderOnly,
            ..fast_config()
        };
        let (_controller, mut events) = open(config, &factory).await;
        let provider = factory.session(BackendKind::Provider);

        provider.emit_error(ErrorKind::BackendUnavailable);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::Error {
                kind: ErrorKind::BackendUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_handover_feeds_both_then_retires_old() {
        let factory = StubFactory::new();
        let (controller, _events) = open(fast_config(), &factory).await;
        let provider = factory.session(BackendKind::Provider);

        for _ in 0..3 {
            provider.emit_error(ErrorKind::BackendTimeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Within the handover window: both sessions receive the stream
        controller
            .push_frame(AudioFrame::silence(1, 20))
            .await
            .unwrap();
        let local = factory.session(BackendKind::Local);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(provider.pushed.lock().contains(&1));
        assert!(local.pushed.lock().contains(&1));

        // After the window the old session is closed and no longer fed
        assert!(provider.closed.load(Ordering::Acquire));
        controller
            .push_frame(AudioFrame::silence(2, 40))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!provider.pushed.lock().contains(&2));
        assert!(local.pushed.lock().contains(&2));
    }

    #[tokio::test]
    async fn test_close_closes_inner_sessions() {
        let factory = StubFactory::new();
        let (controller, mut events) = open(fast_config(), &factory).await;
        controller.close().await.unwrap();
        controller.close().await.unwrap();

        let provider = factory.session(BackendKind::Provider);
        assert!(provider.closed.load(Ordering::Acquire));

        let mut saw_closed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if event == SessionEvent::Closed {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
    }
}
