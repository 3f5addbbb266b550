mod factory;

pub use factory::DefaultSessionFactory;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::auth::{NonceStore, TokenVerifier};
use crate::config::ServerConfig;
use crate::core::call::{CallDeps, FsmConfig, RewardCalculator};
use crate::core::feedback::{FeedbackStore, RewardOutbox};
use crate::core::policy::{DeployConfig, DeployGate, PolicyCatalog};
use crate::core::recorder::{CallRecorder, RecorderConfig};
use crate::core::session::stubs::{ScriptedStt, TemplateLlm, ToneTts};
use crate::core::session::FailoverConfig;

/// Default location of the append-only feedback log.
const DEFAULT_FEEDBACK_PATH: &str = "./data/rl/feedback.jsonl";

/// Retry cadence for rewards whose persistence failed.
const OUTBOX_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide shared state, built once at boot and handed to every
/// connection by reference. There are no module-level globals; everything
/// a call needs lives here.
pub struct AppState {
    pub config: ServerConfig,
    pub catalog: Arc<PolicyCatalog>,
    pub deploy: Arc<DeployGate>,
    pub feedback: Arc<FeedbackStore>,
    pub outbox: Arc<RewardOutbox>,
    pub recorder: Arc<CallRecorder>,
    pub nonces: Arc<NonceStore>,
    pub verifier: Option<TokenVerifier>,
    pub call_deps: CallDeps,
}

impl AppState {
    /// Build the shared state and spawn its background tasks (recorder
    /// janitor, reward outbox retry).
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, String> {
        let catalog = match &config.policy_catalog_path {
            Some(path) => Arc::new(
                PolicyCatalog::load(path).map_err(|e| format!("policy catalog: {e}"))?,
            ),
            None => {
                info!("no policy catalog configured, using the built-in variants");
                Arc::new(PolicyCatalog::builtin())
            }
        };

        let deploy_config = DeployConfig {
            traffic_split_new: config.traffic_split_new,
            traffic_split_uncertain: config.traffic_split_uncertain,
            blacklist_min_samples: config.blacklist_min_samples,
            blacklist_min_reward: config.blacklist_min_reward,
            bandit_state_path: config.bandit_state_path.clone(),
            deploy_state_path: config.deploy_state_path.clone(),
            ..Default::default()
        };
        let deploy = Arc::new(DeployGate::new(
            &catalog,
            deploy_config,
            StdRng::from_entropy(),
        ));

        let feedback = Arc::new(FeedbackStore::new(DEFAULT_FEEDBACK_PATH));
        let outbox = Arc::new(RewardOutbox::default());
        let recorder = Arc::new(CallRecorder::new(RecorderConfig::from_server(&config)));
        let nonces = Arc::new(NonceStore::new());
        let verifier =
            TokenVerifier::from_config(&config).map_err(|e| format!("auth config: {e}"))?;

        // The pipeline engines behind the local session are pluggable; the
        // built-in reference engines keep the core operable without model
        // assets.
        let factory = Arc::new(DefaultSessionFactory::new(
            &config,
            Arc::clone(&catalog),
            Arc::new(ScriptedStt::new("caller audio received")),
            Arc::new(TemplateLlm::new("I can help with that right away")),
            Arc::new(ToneTts::default()),
        ));

        let call_deps = CallDeps {
            deploy: Arc::clone(&deploy),
            feedback: Arc::clone(&feedback),
            outbox: Arc::clone(&outbox),
            reward: RewardCalculator::default(),
            catalog: Arc::clone(&catalog),
            factory,
            failover: FailoverConfig::from_server(&config),
            fsm: FsmConfig::default(),
        };

        let state = Arc::new(Self {
            config,
            catalog,
            deploy,
            feedback,
            outbox,
            recorder: Arc::clone(&recorder),
            nonces,
            verifier,
            call_deps,
        });

        if recorder.enabled() {
            tokio::spawn(Arc::clone(&recorder).run_janitor(Duration::from_secs(3600)));
        }
        tokio::spawn(Arc::clone(&state).run_outbox_retry());

        Ok(state)
    }

    /// Retry persistence for parked rewards on a fixed backoff.
    ///
    /// The in-memory bandit already holds these rewards; only durability is
    /// outstanding, so a successful persist drains the outbox.
    async fn run_outbox_retry(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(OUTBOX_RETRY_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.outbox.is_empty() {
                continue;
            }
            match self.deploy.persist_now().await {
                Ok(()) => {
                    let drained = self.outbox.drain();
                    info!(count = drained.len(), "parked rewards persisted");
                }
                Err(e) => warn!("reward outbox retry failed: {e}"),
            }
        }
    }

    /// Final flush on shutdown: one last attempt to persist policy state.
    pub async fn shutdown(&self) {
        if let Err(e) = self.deploy.persist_now().await {
            warn!("final state persistence failed: {e}");
        } else {
            let drained = self.outbox.drain();
            if !drained.is_empty() {
                info!(count = drained.len(), "outbox flushed at shutdown");
            }
        }
    }
}
