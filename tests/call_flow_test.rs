//! Full call flow through the public surface: state machine, local stub
//! pipeline, feedback store and deploy gate working together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use tokio::sync::mpsc;

use voxgate::core::audio::{pcm_from_samples, AudioFrame, FrameBus, FrameQueue, FRAME_SAMPLES};
use voxgate::core::call::{CallDeps, CallFsm, CallInput, CallOutput, CallState, FsmConfig, RewardCalculator};
use voxgate::core::feedback::{FeedbackStore, RewardOutbox};
use voxgate::core::policy::{DeployConfig, DeployGate, PolicyCatalog};
use voxgate::core::session::stubs::{ScriptedStt, TemplateLlm, ToneTts};
use voxgate::core::session::{
    BackendKind, FailoverConfig, LocalSession, LocalSessionConfig, SessionDescriptor,
    SessionError, SessionFactory, VoiceSession,
};
use voxgate::config::BackendMode;

struct StubPipelineFactory {
    transcript: &'static str,
}

#[async_trait]
impl SessionFactory for StubPipelineFactory {
    async fn build(
        &self,
        _kind: BackendKind,
        descriptor: SessionDescriptor,
        outbound: Arc<FrameQueue>,
    ) -> Result<Arc<dyn VoiceSession>, SessionError> {
        let descriptor = SessionDescriptor::new(
            &descriptor.call_id,
            &descriptor.policy_variant_id,
            BackendKind::Local,
        );
        Ok(Arc::new(LocalSession::new(
            descriptor,
            LocalSessionConfig::default(),
            outbound,
            Arc::new(ScriptedStt::new(self.transcript)),
            Arc::new(TemplateLlm::new("happy to help with that")),
            Arc::new(ToneTts::default()),
        )))
    }
}

struct CallHarness {
    deps: CallDeps,
    feedback: Arc<FeedbackStore>,
    _dir: TempDir,
}

fn harness() -> CallHarness {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(PolicyCatalog::builtin());
    let deploy = Arc::new(DeployGate::new(
        &catalog,
        DeployConfig::default(),
        StdRng::seed_from_u64(21),
    ));
    let feedback = Arc::new(FeedbackStore::new(dir.path().join("feedback.jsonl")));
    let deps = CallDeps {
        deploy,
        feedback: Arc::clone(&feedback),
        outbox: Arc::new(RewardOutbox::default()),
        reward: RewardCalculator::default(),
        catalog,
        factory: Arc::new(StubPipelineFactory {
            transcript: "what time do you open tomorrow",
        }),
        failover: FailoverConfig {
            policy: BackendMode::LocalOnly,
            ..Default::default()
        },
        fsm: FsmConfig::default(),
    };
    CallHarness {
        deps,
        feedback,
        _dir: dir,
    }
}

fn loud(seq: u64) -> AudioFrame {
    AudioFrame::new(seq, seq * 20, pcm_from_samples(&[9_000i16; FRAME_SAMPLES]))
}

fn quiet(seq: u64) -> AudioFrame {
    AudioFrame::silence(seq, seq * 20)
}

async fn push_user_turn(bus: &FrameBus, seq: &mut u64) {
    for _ in 0..10 {
        bus.inbound.push(loud(*seq));
        *seq += 1;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..11 {
        bus.inbound.push(quiet(*seq));
        *seq += 1;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..10 {
        bus.inbound.push(quiet(*seq));
        *seq += 1;
    }
}

async fn wait_for(
    outputs: &mut mpsc::Receiver<CallOutput>,
    pred: impl Fn(&CallOutput) -> bool,
) -> Vec<CallOutput> {
    let mut seen = Vec::new();
    loop {
        let output = tokio::time::timeout(Duration::from_secs(5), outputs.recv())
            .await
            .expect("timed out waiting for call output")
            .expect("output channel closed");
        let done = pred(&output);
        seen.push(output);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_answered_call_produces_exactly_one_feedback_event() {
    let h = harness();
    let bus = FrameBus::default();
    let (input_tx, input_rx) = mpsc::channel(32);
    let (output_tx, mut outputs) = mpsc::channel(256);

    let fsm = CallFsm::new(h.deps.clone(), "flow-call-1", "support", bus.clone(), output_tx);
    let handle = tokio::spawn(fsm.run(input_rx));

    input_tx.send(CallInput::IncomingCall).await.unwrap();
    input_tx.send(CallInput::CallAnswered).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut seq = 0;
    push_user_turn(&bus, &mut seq).await;
    let seen = wait_for(&mut outputs, |o| matches!(o, CallOutput::TurnEnd { .. })).await;

    // Transcript and tokens streamed to the client before the turn closed
    assert!(seen
        .iter()
        .any(|o| matches!(o, CallOutput::SttFinal { text, .. } if text.contains("open tomorrow"))));
    assert!(seen.iter().any(|o| matches!(o, CallOutput::LlmToken { .. })));

    input_tx
        .send(CallInput::ClientBye {
            resolution: Some(true),
            user_rating: Some(4),
        })
        .await
        .unwrap();
    wait_for(&mut outputs, |o| matches!(o, CallOutput::Ended { .. })).await;

    let fsm = handle.await.unwrap();
    assert_eq!(fsm.state(), CallState::Ended);

    let stats = h.feedback.stats(0).await.unwrap();
    assert_eq!(stats.total_events, 1);
    assert_eq!(stats.by_profile.get("support"), Some(&1));
}

#[tokio::test]
async fn test_unanswered_call_leaves_no_trace_in_store() {
    let h = harness();
    let bus = FrameBus::default();
    let (input_tx, input_rx) = mpsc::channel(32);
    let (output_tx, mut outputs) = mpsc::channel(64);

    let fsm = CallFsm::new(h.deps.clone(), "flow-call-2", "general", bus, output_tx);
    let handle = tokio::spawn(fsm.run(input_rx));

    input_tx.send(CallInput::IncomingCall).await.unwrap();
    input_tx.send(CallInput::Hangup).await.unwrap();
    wait_for(&mut outputs, |o| matches!(o, CallOutput::Ended { .. })).await;
    handle.await.unwrap();

    assert_eq!(h.feedback.stats(0).await.unwrap().total_events, 0);
}

#[tokio::test]
async fn test_stored_event_is_anonymized() {
    let h = harness();
    let bus = FrameBus::default();
    let (input_tx, input_rx) = mpsc::channel(32);
    let (output_tx, mut outputs) = mpsc::channel(256);

    let raw_call_id = "caller-0171-555-0199";
    let fsm = CallFsm::new(h.deps.clone(), raw_call_id, "general", bus, output_tx);
    let handle = tokio::spawn(fsm.run(input_rx));

    input_tx.send(CallInput::IncomingCall).await.unwrap();
    input_tx.send(CallInput::CallAnswered).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    input_tx
        .send(CallInput::ClientBye {
            resolution: None,
            user_rating: None,
        })
        .await
        .unwrap();
    wait_for(&mut outputs, |o| matches!(o, CallOutput::Ended { .. })).await;
    handle.await.unwrap();

    // The raw call id never reaches the store file
    let raw = std::fs::read_to_string(h.feedback.path()).unwrap();
    assert!(!raw.contains(raw_call_id));
    assert!(raw.contains("anon_"));
}

#[tokio::test]
async fn test_outbound_audio_reaches_bus_with_monotone_seq() {
    let h = harness();
    let bus = FrameBus::default();
    let (input_tx, input_rx) = mpsc::channel(32);
    let (output_tx, mut outputs) = mpsc::channel(256);

    let fsm = CallFsm::new(h.deps.clone(), "flow-call-3", "general", bus.clone(), output_tx);
    let handle = tokio::spawn(fsm.run(input_rx));

    input_tx.send(CallInput::IncomingCall).await.unwrap();
    input_tx.send(CallInput::CallAnswered).await.unwrap();

    // The greeting alone must produce outbound audio
    let first = tokio::time::timeout(Duration::from_secs(5), bus.outbound.recv())
        .await
        .expect("no greeting audio");
    let second = tokio::time::timeout(Duration::from_secs(5), bus.outbound.recv())
        .await
        .expect("no second greeting frame");
    assert_eq!(second.seq, first.seq + 1);
    assert!(second.ts_ms >= first.ts_ms);

    input_tx.send(CallInput::Hangup).await.unwrap();
    wait_for(&mut outputs, |o| matches!(o, CallOutput::Ended { .. })).await;
    handle.await.unwrap();
}
