//! Moderation gateway: the single path by which text reaches the remote classifier.
//!
//! Order of checks: feature flag, rate limit, breaker, redaction, one bounded remote call,
//! JSON extraction, caller validation. Every failure resolves to the caller's fallback;
//! nothing is raised and nothing is retried.

use super::circuit_breaker::CircuitBreaker;
use super::classifier::{ClassifierClient, ClassifierError, ClassifierRequest, TokenUsage};
use super::extract::extract_json_object;
use super::rate_limiter::RateLimiter;
use crate::config::ModerationConfig;
use crate::metrics::ModerationMetrics;
use crate::security::{sanitize_log_fields, Redactor};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const RESPONSE_CONTRACT: &str = "Respond with exactly one JSON object matching the schema above. \
Do not add prose, markdown, or code fences.";

/// Rejection raised by a caller-supplied validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Why a moderation request was answered with its fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FallbackReason {
    FeatureDisabled,
    RateLimited {
        #[serde(rename = "retryAfterSeconds")]
        retry_after_seconds: u64,
    },
    BreakerOpen,
    TransportFailure,
    Timeout,
    Cancelled,
    UpstreamStatus,
    MalformedResponse,
}

impl FallbackReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FeatureDisabled => "feature_disabled",
            Self::RateLimited { .. } => "rate_limited",
            Self::BreakerOpen => "breaker_open",
            Self::TransportFailure => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UpstreamStatus => "upstream_status",
            Self::MalformedResponse => "malformed_response",
        }
    }

    /// True when the classifier was actually called (and failed), as opposed to skipped.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportFailure
                | Self::Timeout
                | Self::Cancelled
                | Self::UpstreamStatus
                | Self::MalformedResponse
        )
    }
}

/// A moderation result plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Moderated<T> {
    pub value: T,
    /// `None` when `value` came from the classifier; otherwise why the fallback was used.
    pub fallback: Option<FallbackReason>,
}

impl<T> Moderated<T> {
    pub fn classified(value: T) -> Self {
        Self {
            value,
            fallback: None,
        }
    }

    pub fn fallback(value: T, reason: FallbackReason) -> Self {
        Self {
            value,
            fallback: Some(reason),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// One moderation request.
#[derive(Debug, Clone, Copy)]
pub struct ModerationRequest<'a> {
    /// Rate-limit identity (usually the sender id).
    pub identity: &'a str,
    /// Operation kind; also the metric label and the breaker accounting key in logs.
    pub operation: &'a str,
    /// Operation-specific system instruction including the JSON schema.
    pub instruction: &'a str,
    /// Raw payload text. Redacted before it leaves the process.
    pub payload: &'a str,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub enabled: bool,
    pub max_output_tokens: u32,
    pub request_timeout: Duration,
    pub cost_per_1k_prompt_tokens: f64,
    pub cost_per_1k_completion_tokens: f64,
}

impl From<&ModerationConfig> for GatewaySettings {
    fn from(cfg: &ModerationConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            max_output_tokens: cfg.max_output_tokens,
            request_timeout: cfg.request_timeout(),
            cost_per_1k_prompt_tokens: cfg.cost_per_1k_prompt_tokens,
            cost_per_1k_completion_tokens: cfg.cost_per_1k_completion_tokens,
        }
    }
}

/// Records exactly one breaker outcome for a remote attempt, even if the caller drops the
/// future while the request is in flight.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    metrics: &'a ModerationMetrics,
    operation: &'a str,
    settled: bool,
}

impl<'a> OutcomeGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, metrics: &'a ModerationMetrics, operation: &'a str) -> Self {
        Self {
            breaker,
            metrics,
            operation,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_outcome(true);
    }

    fn fail(mut self, reason: FallbackReason) {
        self.settled = true;
        self.breaker.record_outcome(false);
        self.metrics.increment_error(self.operation, reason.label());
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_outcome(false);
            self.metrics
                .increment_error(self.operation, FallbackReason::Cancelled.label());
            tracing::warn!(operation = %self.operation, "moderation call cancelled by caller");
        }
    }
}

/// Admission-controlled, breaker-guarded access to the remote classifier.
pub struct ModerationGateway {
    settings: GatewaySettings,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    redactor: Redactor,
    client: Arc<dyn ClassifierClient>,
    metrics: Arc<ModerationMetrics>,
}

impl ModerationGateway {
    pub fn new(
        settings: GatewaySettings,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        client: Arc<dyn ClassifierClient>,
        metrics: Arc<ModerationMetrics>,
    ) -> Self {
        Self {
            settings,
            limiter,
            breaker,
            redactor: Redactor::new(),
            client,
            metrics,
        }
    }

    /// Replace the outbound redactor (e.g. one carrying family-protected terms).
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &ModerationMetrics {
        &self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn degrade<T>(&self, operation: &str, fallback: T, reason: FallbackReason) -> Moderated<T> {
        self.metrics.record_fallback(operation, reason.label());
        Moderated::fallback(fallback, reason)
    }

    /// Run one moderation request. Always resolves: either `validate`'s result or `fallback`.
    pub async fn moderate<T, F>(&self, req: ModerationRequest<'_>, validate: F, fallback: T) -> Moderated<T>
    where
        F: FnOnce(Value) -> Result<T, ValidationError>,
    {
        if !self.settings.enabled {
            tracing::debug!(operation = %req.operation, "moderation disabled; using fallback");
            return self.degrade(req.operation, fallback, FallbackReason::FeatureDisabled);
        }

        let admission = self.limiter.admit(req.identity);
        if !admission.allowed {
            let retry_after_seconds = admission.retry_after_seconds.unwrap_or(1);
            tracing::warn!(
                operation = %req.operation,
                retry_after_seconds,
                "moderation rate limit hit; using fallback"
            );
            return self.degrade(
                req.operation,
                fallback,
                FallbackReason::RateLimited { retry_after_seconds },
            );
        }

        if self.breaker.is_open() {
            tracing::warn!(
                operation = %req.operation,
                breaker = %self.breaker.name(),
                "classifier breaker open; using fallback"
            );
            return self.degrade(req.operation, fallback, FallbackReason::BreakerOpen);
        }

        let request = ClassifierRequest {
            operation: req.operation.to_string(),
            system: format!("{}\n\n{}", req.instruction, RESPONSE_CONTRACT),
            user: self.redactor.redact(req.payload),
            max_output_tokens: self.settings.max_output_tokens,
            temperature: 0.0,
        };

        let guard = OutcomeGuard::new(&self.breaker, &self.metrics, req.operation);
        let started = Instant::now();
        let result = tokio::time::timeout(self.settings.request_timeout, self.client.complete(&request)).await;
        let elapsed = started.elapsed();

        let reply = match result {
            Err(_) => {
                tracing::warn!(
                    operation = %req.operation,
                    timeout_ms = self.settings.request_timeout.as_millis() as u64,
                    "classifier call timed out"
                );
                guard.fail(FallbackReason::Timeout);
                return self.degrade(req.operation, fallback, FallbackReason::Timeout);
            }
            Ok(Err(e)) => {
                let reason = match e {
                    ClassifierError::Status { .. } => FallbackReason::UpstreamStatus,
                    ClassifierError::Transport(_) | ClassifierError::Decode(_) => {
                        FallbackReason::TransportFailure
                    }
                };
                tracing::warn!(operation = %req.operation, error = %e, "classifier call failed");
                guard.fail(reason);
                return self.degrade(req.operation, fallback, reason);
            }
            Ok(Ok(reply)) => reply,
        };

        let validated = extract_json_object(&reply.content)
            .map_err(|e| ValidationError::new(e.to_string()))
            .and_then(validate);

        match validated {
            Ok(value) => {
                guard.succeed();
                self.metrics
                    .observe_duration(req.operation, elapsed.as_secs_f64());
                self.log_accounting(req, reply.usage.unwrap_or_default(), elapsed);
                Moderated::classified(value)
            }
            Err(e) => {
                tracing::warn!(
                    operation = %req.operation,
                    error = %e,
                    "classifier response rejected"
                );
                guard.fail(FallbackReason::MalformedResponse);
                self.degrade(req.operation, fallback, FallbackReason::MalformedResponse)
            }
        }
    }

    fn log_accounting(&self, req: ModerationRequest<'_>, usage: TokenUsage, elapsed: Duration) {
        let cost = f64::from(usage.prompt_tokens) / 1000.0 * self.settings.cost_per_1k_prompt_tokens
            + f64::from(usage.completion_tokens) / 1000.0 * self.settings.cost_per_1k_completion_tokens;
        let entry = sanitize_log_fields(&serde_json::json!({
            "operation": req.operation,
            "identity": req.identity,
            "model": self.client.model(),
            "input_units": usage.prompt_tokens,
            "output_units": usage.completion_tokens,
            "estimated_cost_usd": cost,
            "duration_ms": elapsed.as_millis() as u64,
        }));
        tracing::info!(target: "hearth::accounting", entry = %entry, "moderation call accounted");
    }
}
