use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::core::audio::FrameQueue;
use crate::core::policy::PolicyCatalog;
use crate::core::session::backends::{LlmEngine, SttEngine, TtsEngine};
use crate::core::session::{
    BackendKind, LocalSession, LocalSessionConfig, ProviderConnector, ProviderSession,
    SessionDescriptor, SessionError, SessionFactory, VoiceSession, WsProviderConnector,
};

/// Builds provider or local sessions from the process configuration.
///
/// The provider path is hard-gated: without the explicit egress opt-in no
/// provider session can be constructed, regardless of failover policy.
pub struct DefaultSessionFactory {
    allow_external_backend: bool,
    connector: Option<Arc<dyn ProviderConnector>>,
    catalog: Arc<PolicyCatalog>,
    stt: Arc<dyn SttEngine>,
    llm: Arc<dyn LlmEngine>,
    tts: Arc<dyn TtsEngine>,
}

impl DefaultSessionFactory {
    pub fn new(
        config: &ServerConfig,
        catalog: Arc<PolicyCatalog>,
        stt: Arc<dyn SttEngine>,
        llm: Arc<dyn LlmEngine>,
        tts: Arc<dyn TtsEngine>,
    ) -> Self {
        let connector: Option<Arc<dyn ProviderConnector>> = match &config.provider_url {
            Some(url) if config.allow_external_backend => {
                Some(Arc::new(WsProviderConnector::new(url)))
            }
            _ => None,
        };
        Self {
            allow_external_backend: config.allow_external_backend,
            connector,
            catalog,
            stt,
            llm,
            tts,
        }
    }

    /// Override the provider connector (tests, alternative transports).
    pub fn with_connector(mut self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn build(
        &self,
        kind: BackendKind,
        descriptor: SessionDescriptor,
        outbound: Arc<FrameQueue>,
    ) -> Result<Arc<dyn VoiceSession>, SessionError> {
        match kind {
            BackendKind::Provider => {
                if !self.allow_external_backend {
                    return Err(SessionError::Unavailable(
                        "external backend disabled by configuration".to_string(),
                    ));
                }
                let connector = self.connector.clone().ok_or_else(|| {
                    SessionError::Unavailable("no provider endpoint configured".to_string())
                })?;
                Ok(Arc::new(ProviderSession::new(descriptor, connector, outbound)))
            }
            BackendKind::Local => {
                let sensitivity = self
                    .catalog
                    .get(&descriptor.policy_variant_id)
                    .map(|v| v.parameters.barge_in_sensitivity)
                    .unwrap_or(0.5);
                Ok(Arc::new(LocalSession::new(
                    descriptor,
                    LocalSessionConfig::for_sensitivity(sensitivity),
                    outbound,
                    Arc::clone(&self.stt),
                    Arc::clone(&self.llm),
                    Arc::clone(&self.tts),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::stubs::{ScriptedStt, TemplateLlm, ToneTts};

    fn factory(config: &ServerConfig) -> DefaultSessionFactory {
        DefaultSessionFactory::new(
            config,
            Arc::new(PolicyCatalog::builtin()),
            Arc::new(ScriptedStt::new("hello")),
            Arc::new(TemplateLlm::new("hi")),
            Arc::new(ToneTts::default()),
        )
    }

    #[tokio::test]
    async fn test_provider_hard_gate() {
        let config = ServerConfig::default();
        assert!(!config.allow_external_backend);
        let factory = factory(&config);

        let descriptor = SessionDescriptor::new("c", "v1a", BackendKind::Provider);
        let outbound = Arc::new(FrameQueue::new(16, "outbound"));
        let err = match factory.build(BackendKind::Provider, descriptor, outbound).await {
            Err(e) => e,
            Ok(_) => panic!("expected build to fail"),
        };
        assert!(matches!(err, SessionError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_local_build_succeeds() {
        let config = ServerConfig::default();
        let factory = factory(&config);
        let descriptor = SessionDescriptor::new("c", "v1a", BackendKind::Local);
        let outbound = Arc::new(FrameQueue::new(16, "outbound"));
        let session = factory
            .build(BackendKind::Local, descriptor, outbound)
            .await
            .unwrap();
        assert_eq!(session.descriptor().backend, BackendKind::Local);
    }
}
