//! Pre-send hostility gate.

use super::gateway::{ModerationGateway, ModerationRequest, Moderated, ValidationError};
use crate::shared::ToneAnalysisResult;
use serde_json::Value;
use std::sync::Arc;

pub const TONE_OPERATION: &str = "tone_check";

const TONE_INSTRUCTION: &str = "You screen messages between co-parents before they are sent. \
Decide whether the message is hostile: insults, threats, contempt, shouting, blame, or \
sarcasm aimed at the other parent. Firm but respectful disagreement is not hostile.\n\
Schema: {\"isHostile\": boolean, \"indicators\": string[], \"neutralRewrite\": string}\n\
indicators are short labels for what made the message hostile (empty when not hostile). \
neutralRewrite keeps the sender's intent in a calm, factual tone (empty when not hostile).";

/// Classifies a draft as hostile or not, with indicators and a neutral rewrite.
pub struct ToneClassifier {
    gateway: Arc<ModerationGateway>,
}

impl ToneClassifier {
    pub fn new(gateway: Arc<ModerationGateway>) -> Self {
        Self { gateway }
    }

    /// Fails open: any failure yields `{isHostile: false, indicators: [], neutralRewrite: ""}`
    /// with the reason in `fallback`.
    pub async fn classify(&self, identity: &str, text: &str) -> Moderated<ToneAnalysisResult> {
        let request = ModerationRequest {
            identity,
            operation: TONE_OPERATION,
            instruction: TONE_INSTRUCTION,
            payload: text,
        };
        let verdict = self
            .gateway
            .moderate(request, validate_tone, ToneAnalysisResult::permissive())
            .await;
        tracing::debug!(
            identity = %identity,
            is_hostile = verdict.value.is_hostile,
            indicators = verdict.value.indicators.len(),
            fallback = verdict.fallback.map(|r| r.label()),
            "tone check complete"
        );
        verdict
    }
}

fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `isHostile` is required; the other fields are coerced to empty values when absent or
/// malformed.
pub fn validate_tone(raw: Value) -> Result<ToneAnalysisResult, ValidationError> {
    let is_hostile = raw
        .get("isHostile")
        .or_else(|| raw.get("is_hostile"))
        .and_then(coerce_bool)
        .ok_or_else(|| ValidationError::new("isHostile missing or not a boolean"))?;

    let indicators = raw
        .get("indicators")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let neutral_rewrite = raw
        .get("neutralRewrite")
        .or_else(|| raw.get("neutral_rewrite"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    Ok(ToneAnalysisResult {
        is_hostile,
        indicators,
        neutral_rewrite,
    })
}
