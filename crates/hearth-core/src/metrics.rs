//! Prometheus metrics for the moderation path.
//!
//! Each [`ModerationMetrics`] owns its own `Registry` so services (and tests) never collide
//! on the process-global default registry.

use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

/// Duration histogram keyed by operation, error counter keyed by source, fallback counter
/// keyed by operation and reason.
pub struct ModerationMetrics {
    registry: Registry,
    duration: HistogramVec,
    errors: IntCounterVec,
    fallbacks: IntCounterVec,
}

impl ModerationMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let duration = HistogramVec::new(
            histogram_opts!(
                "hearth_moderation_duration_seconds",
                "Successful remote moderation call duration in seconds",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["operation"],
        )?;
        let errors = IntCounterVec::new(
            opts!(
                "hearth_moderation_errors_total",
                "Failed remote moderation calls by source and reason"
            ),
            &["source", "reason"],
        )?;
        let fallbacks = IntCounterVec::new(
            opts!(
                "hearth_moderation_fallbacks_total",
                "Moderation requests answered with the fallback value"
            ),
            &["operation", "reason"],
        )?;

        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(fallbacks.clone()))?;

        Ok(Self {
            registry,
            duration,
            errors,
            fallbacks,
        })
    }

    pub fn observe_duration(&self, operation: &str, seconds: f64) {
        self.duration.with_label_values(&[operation]).observe(seconds);
    }

    pub fn increment_error(&self, source: &str, reason: &str) {
        self.errors.with_label_values(&[source, reason]).inc();
    }

    pub fn record_fallback(&self, operation: &str, reason: &str) {
        self.fallbacks.with_label_values(&[operation, reason]).inc();
    }

    pub fn error_count(&self, source: &str, reason: &str) -> u64 {
        self.errors.with_label_values(&[source, reason]).get()
    }

    pub fn fallback_count(&self, operation: &str, reason: &str) -> u64 {
        self.fallbacks.with_label_values(&[operation, reason]).get()
    }

    pub fn duration_samples(&self, operation: &str) -> u64 {
        self.duration
            .with_label_values(&[operation])
            .get_sample_count()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric in this registry.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode moderation metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
