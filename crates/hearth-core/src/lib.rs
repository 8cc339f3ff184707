//! hearth-core: moderated family messaging channel.
//!
//! Drafts pass a remote tone gate (rate-limited, breaker-guarded, PII-redacted) before they
//! are linked into a per-thread hash chain and persisted. A mediation advisor estimates
//! conflict over recent conversation.

pub mod chain;
pub mod config;
mod error;
pub mod metrics;
pub mod moderation;
pub mod security;
mod services;
mod shared;
pub mod store;
pub mod workflow;

// Shared types
pub use shared::{
    ConflictLevel, ConversationLine, MediationAssistantResult, Message, Thread, ToneAnalysis,
    ToneAnalysisResult,
};

// Errors
pub use error::{ChainError, ConfigError, StoreError, StoreResult, WorkflowError};

// Config
pub use config::{FailurePolicy, HearthConfig, ModerationConfig, StoreBackend};

// Moderation
pub use metrics::ModerationMetrics;
pub use moderation::{
    extract_json_object, FallbackReason, MediationAdvisor, ModerationGateway, Moderated,
    ToneClassifier,
};
pub use security::{sanitize_log_fields, Redactor};

// Threads and submission
pub use chain::{ChainIssue, ChainReport, MessageChain, NewMessage};
pub use services::{BuildError, Hearth};
#[cfg(feature = "sled-store")]
pub use store::SledMessageStore;
pub use store::{MemoryMessageStore, MessageStore};
pub use workflow::{
    Draft, MessageSubmissionWorkflow, RejectionReason, SubmissionOutcome, SubmissionState,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
