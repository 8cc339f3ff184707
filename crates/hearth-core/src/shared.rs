//! Shared types for the moderated messaging channel: messages, threads, and the
//! caller-facing result shapes of the tone gate and the mediation advisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tone verdict recorded on a stored message (the rewrite suggestion is not persisted).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneAnalysis {
    pub is_hostile: bool,
    #[serde(default)]
    pub indicators: Vec<String>,
}

/// A message appended to a thread's hash-linked history.
///
/// `body` is the original plaintext. Redaction only ever applies to the copy sent to the
/// remote classifier, never to what is stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub family_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
    #[serde(default)]
    pub tone_analysis: ToneAnalysis,
    pub message_hash: String,
    #[serde(default)]
    pub previous_hash: Option<String>,
    pub chain_index: u64,
}

/// A conversation inside a family. Its messages are ordered by `chain_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub family_id: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// Result of the pre-send hostility gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneAnalysisResult {
    pub is_hostile: bool,
    pub indicators: Vec<String>,
    pub neutral_rewrite: String,
}

impl ToneAnalysisResult {
    /// The fail-open verdict: not hostile, nothing flagged.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn to_analysis(&self) -> ToneAnalysis {
        ToneAnalysis {
            is_hostile: self.is_hostile,
            indicators: self.indicators.clone(),
        }
    }
}

/// Conversation-level conflict estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictLevel {
    Low,
    Medium,
    High,
}

impl ConflictLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Result of the de-escalation advisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediationAssistantResult {
    pub conflict_level: ConflictLevel,
    pub deescalation_tips: Vec<String>,
}

/// One entry of recent conversation passed to the mediation advisor (oldest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationLine {
    pub sender_id: String,
    pub body: String,
}

impl From<&Message> for ConversationLine {
    fn from(m: &Message) -> Self {
        Self {
            sender_id: m.sender_id.clone(),
            body: m.body.clone(),
        }
    }
}
