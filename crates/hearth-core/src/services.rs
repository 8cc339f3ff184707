//! Service assembly: builds every stateful service once and hands out shared handles.

use crate::chain::MessageChain;
use crate::config::{HearthConfig, ModerationConfig, StoreBackend};
use crate::error::StoreError;
use crate::metrics::ModerationMetrics;
use crate::moderation::{
    BreakerSettings, CircuitBreaker, ClassifierClient, ClassifierError, ClassifierReply,
    ClassifierRequest, GatewaySettings, MediationAdvisor, ModerationGateway, OpenRouterClassifier,
    RateLimiter, ToneClassifier,
};
use crate::store::{MemoryMessageStore, MessageStore};
use crate::workflow::MessageSubmissionWorkflow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to open message store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Stand-in used when no API key is configured: every call fails fast, so the gateway falls
/// back (and the breaker opens) exactly as it would for an unreachable classifier.
struct UnconfiguredClassifier;

#[async_trait::async_trait]
impl ClassifierClient for UnconfiguredClassifier {
    fn model(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _request: &ClassifierRequest) -> Result<ClassifierReply, ClassifierError> {
        Err(ClassifierError::Transport("no classifier API key configured".to_string()))
    }
}

impl From<&ModerationConfig> for BreakerSettings {
    fn from(cfg: &ModerationConfig) -> Self {
        Self {
            window: cfg.breaker_window(),
            min_requests: cfg.breaker_min_requests,
            error_ratio: cfg.breaker_error_ratio,
            cooldown: cfg.breaker_cooldown(),
        }
    }
}

/// All core services for one process.
#[derive(Clone)]
pub struct Hearth {
    pub store: Arc<dyn MessageStore>,
    pub metrics: Arc<ModerationMetrics>,
    pub gateway: Arc<ModerationGateway>,
    pub tone: Arc<ToneClassifier>,
    pub mediation: Arc<MediationAdvisor>,
    pub chain: Arc<MessageChain>,
    pub workflow: Arc<MessageSubmissionWorkflow>,
}

impl Hearth {
    /// Open the configured store and build services around the configured classifier.
    pub fn from_config(cfg: &HearthConfig) -> Result<Self, BuildError> {
        let store = open_store(cfg)?;
        let client: Arc<dyn ClassifierClient> = match OpenRouterClassifier::from_config(&cfg.moderation) {
            Some(c) => Arc::new(c),
            None => {
                if cfg.moderation.enabled {
                    tracing::warn!("moderation enabled but no API key configured; classifier calls will fall back");
                }
                Arc::new(UnconfiguredClassifier)
            }
        };
        Self::assemble(&cfg.moderation, store, client)
    }

    /// Build services from explicit collaborators (tests and embedding).
    pub fn assemble(
        moderation: &ModerationConfig,
        store: Arc<dyn MessageStore>,
        client: Arc<dyn ClassifierClient>,
    ) -> Result<Self, BuildError> {
        let metrics = Arc::new(ModerationMetrics::new()?);
        let limiter = Arc::new(RateLimiter::new(
            moderation.rate_limit_window(),
            moderation.rate_limit_capacity,
        ));
        let breaker = Arc::new(CircuitBreaker::new("classifier", BreakerSettings::from(moderation)));
        let gateway = Arc::new(ModerationGateway::new(
            GatewaySettings::from(moderation),
            limiter,
            breaker,
            client,
            Arc::clone(&metrics),
        ));
        let tone = Arc::new(ToneClassifier::new(Arc::clone(&gateway)));
        let mediation = Arc::new(MediationAdvisor::new(Arc::clone(&gateway)));
        let chain = Arc::new(MessageChain::new(Arc::clone(&store)));
        let workflow = Arc::new(MessageSubmissionWorkflow::new(
            Arc::clone(&tone),
            Arc::clone(&chain),
            moderation.failure_policy,
        ));

        Ok(Self {
            store,
            metrics,
            gateway,
            tone,
            mediation,
            chain,
            workflow,
        })
    }
}

impl Hearth {
    /// Drop rate windows that expired before `now`. Returns how many were removed.
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        self.gateway.limiter().purge_expired(now)
    }

    /// Periodically purge expired rate windows. Must be called inside a Tokio runtime.
    pub fn spawn_maintenance(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let hearth = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = hearth.purge_idle_at(Instant::now());
                if purged > 0 {
                    tracing::debug!(purged, "expired rate windows purged");
                }
            }
        })
    }
}

fn open_store(cfg: &HearthConfig) -> Result<Arc<dyn MessageStore>, StoreError> {
    match cfg.store_backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryMessageStore::new())),
        #[cfg(feature = "sled-store")]
        StoreBackend::Sled => {
            let path = cfg.sled_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("{}: {}", parent.display(), e)))?;
            }
            tracing::info!(path = %path.display(), "opening sled message store");
            Ok(Arc::new(crate::store::SledMessageStore::open_path(path)?))
        }
        #[cfg(not(feature = "sled-store"))]
        StoreBackend::Sled => Err(StoreError::Backend(
            "sled backend requested but the sled-store feature is disabled".to_string(),
        )),
    }
}
