//! Moderation: admission control, breaker, remote classifier, and the two operations built
//! on them (tone gate and mediation advice).

pub mod circuit_breaker;
pub mod classifier;
pub mod extract;
pub mod gateway;
pub mod mediation;
pub mod rate_limiter;
pub mod tone;

pub use circuit_breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use classifier::{
    ClassifierClient, ClassifierError, ClassifierReply, ClassifierRequest, OpenRouterClassifier,
    TokenUsage,
};
pub use extract::{extract_json_object, ExtractError};
pub use gateway::{
    FallbackReason, GatewaySettings, ModerationGateway, ModerationRequest, Moderated,
    ValidationError,
};
pub use mediation::{MediationAdvisor, MAX_CONTEXT_MESSAGES};
pub use rate_limiter::{Admission, RateLimiter};
pub use tone::ToneClassifier;
