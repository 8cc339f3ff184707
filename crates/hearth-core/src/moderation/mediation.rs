//! De-escalation advisor over recent conversation.
//!
//! The remote verdict is preferred; when it is unavailable a local assessment built from
//! keyword topics and hostility markers stands in.

use super::gateway::{ModerationGateway, ModerationRequest, Moderated, ValidationError};
use crate::shared::{ConflictLevel, ConversationLine, MediationAssistantResult};
use serde_json::Value;
use std::sync::Arc;

pub const MEDIATION_OPERATION: &str = "mediation";

/// Only this many of the most recent lines are sent to the classifier.
pub const MAX_CONTEXT_MESSAGES: usize = 15;
pub const MIN_TIPS: usize = 3;
pub const MAX_TIPS: usize = 5;

const MEDIATION_INSTRUCTION: &str = "You help co-parents keep a conversation civil. \
Read the recent messages (oldest first, one per line as `sender: text`) and estimate \
the current level of conflict. Then give 3 to 5 short, concrete de-escalation tips that \
refer to what the conversation is about.\n\
Schema: {\"conflictLevel\": \"low\" | \"medium\" | \"high\", \"deescalationTips\": string[]}";

const FALLBACK_TOPIC: &str = "this conversation";

const TOPICS: &[(&str, &[&str])] = &[
    (
        "the schedule",
        &[
            "schedule", "pickup", "dropoff", "weekend", "weekends", "custody", "calendar", "late",
            "visitation", "exchange",
        ],
    ),
    (
        "expenses",
        &[
            "money", "pay", "paid", "payment", "support", "expense", "expenses", "bill", "bills",
            "cost", "reimburse",
        ],
    ),
    (
        "school",
        &[
            "school", "homework", "teacher", "grades", "class", "conference", "report",
        ],
    ),
    (
        "health care",
        &[
            "doctor", "dentist", "medicine", "medication", "sick", "appointment", "therapy",
            "allergy",
        ],
    ),
    (
        "holiday plans",
        &[
            "holiday", "holidays", "christmas", "thanksgiving", "vacation", "birthday", "summer",
            "trip",
        ],
    ),
    (
        "activities",
        &[
            "practice", "soccer", "game", "lesson", "lessons", "recital", "camp", "tournament",
        ],
    ),
];

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "always", "because", "before", "being", "could", "doing",
    "going", "have", "just", "know", "like", "never", "really", "should", "that", "their",
    "there", "these", "they", "thing", "things", "think", "this", "time", "want", "were",
    "what", "when", "where", "which", "will", "with", "would", "your", "you're",
];

const ABSOLUTES: &[&str] = &["always", "never", "everything", "nothing", "nobody", "everyone"];

const INSULTS: &[&str] = &[
    "idiot", "stupid", "useless", "pathetic", "liar", "selfish", "worthless", "ridiculous",
    "incompetent", "disgusting",
];

/// Estimates conflict level and suggests de-escalation tips.
pub struct MediationAdvisor {
    gateway: Arc<ModerationGateway>,
}

impl MediationAdvisor {
    pub fn new(gateway: Arc<ModerationGateway>) -> Self {
        Self { gateway }
    }

    /// `recent` is ordered oldest first; only the last [`MAX_CONTEXT_MESSAGES`] are used.
    pub async fn advise(
        &self,
        identity: &str,
        recent: &[ConversationLine],
    ) -> Moderated<MediationAssistantResult> {
        let context = &recent[recent.len().saturating_sub(MAX_CONTEXT_MESSAGES)..];
        let payload = context
            .iter()
            .map(|l| format!("{}: {}", l.sender_id, l.body))
            .collect::<Vec<_>>()
            .join("\n");

        let request = ModerationRequest {
            identity,
            operation: MEDIATION_OPERATION,
            instruction: MEDIATION_INSTRUCTION,
            payload: &payload,
        };
        let advice = self
            .gateway
            .moderate(request, validate_mediation, local_assessment(context))
            .await;
        tracing::debug!(
            identity = %identity,
            context_lines = context.len(),
            conflict_level = advice.value.conflict_level.as_str(),
            fallback = advice.fallback.map(|r| r.label()),
            "mediation advice ready"
        );
        advice
    }
}

/// Requires a known conflict level and at least three non-empty tips; keeps the first five.
pub fn validate_mediation(raw: Value) -> Result<MediationAssistantResult, ValidationError> {
    let conflict_level = raw
        .get("conflictLevel")
        .and_then(Value::as_str)
        .and_then(ConflictLevel::parse)
        .ok_or_else(|| ValidationError::new("conflictLevel missing or unknown"))?;

    let mut tips: Vec<String> = raw
        .get("deescalationTips")
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

    if tips.len() < MIN_TIPS {
        return Err(ValidationError::new(format!(
            "expected at least {} tips, got {}",
            MIN_TIPS,
            tips.len()
        )));
    }
    tips.truncate(MAX_TIPS);

    Ok(MediationAssistantResult {
        conflict_level,
        deescalation_tips: tips,
    })
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Topic of a message: the first keyword group it mentions, else its longest content word.
pub fn extract_topic(text: &str) -> String {
    let tokens: Vec<String> = words(text).collect();
    for (topic, keywords) in TOPICS {
        if tokens.iter().any(|t| keywords.contains(&t.as_str())) {
            return topic.to_string();
        }
    }
    tokens
        .iter()
        .filter(|t| t.chars().count() >= 4 && t.chars().all(char::is_alphabetic))
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .fold(None::<&String>, |best, t| match best {
            Some(b) if b.chars().count() >= t.chars().count() => Some(b),
            _ => Some(t),
        })
        .cloned()
        .unwrap_or_else(|| FALLBACK_TOPIC.to_string())
}

fn hostility_score(text: &str) -> u32 {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    let mut score = 0;

    if letters.len() >= 8 && upper * 10 > letters.len() * 6 {
        score += 2;
    }
    if text.contains("!!") {
        score += 1;
    }
    let tokens: Vec<String> = words(text).collect();
    if tokens.iter().any(|t| ABSOLUTES.contains(&t.as_str())) {
        score += 1;
    }
    if tokens.iter().any(|t| INSULTS.contains(&t.as_str())) {
        score += 3;
    }
    score
}

/// Conflict level from local markers summed over the conversation.
pub fn estimate_conflict(lines: &[ConversationLine]) -> ConflictLevel {
    let score: u32 = lines.iter().map(|l| hostility_score(&l.body)).sum();
    match score {
        0..=1 => ConflictLevel::Low,
        2..=4 => ConflictLevel::Medium,
        _ => ConflictLevel::High,
    }
}

fn tips_for(level: ConflictLevel, topic: &str) -> Vec<String> {
    let mut tips = vec![
        format!("Keep messages about {} short and focused on the next concrete step.", topic),
        format!(
            "Acknowledge the other parent's point about {} before adding your own.",
            topic
        ),
        format!(
            "Propose one specific option for {} and ask whether it works for them.",
            topic
        ),
    ];
    if level != ConflictLevel::Low {
        tips.push(
            "Replace words like \"always\" and \"never\" with what happened this time.".to_string(),
        );
    }
    if level == ConflictLevel::High {
        tips.push(format!(
            "Pause before replying; if {} is still unresolved tomorrow, suggest a call or a mediator.",
            topic
        ));
    }
    tips
}

/// Deterministic advice used when the classifier is unavailable: three tips for low
/// conflict, four for medium, five for high.
pub fn local_assessment(lines: &[ConversationLine]) -> MediationAssistantResult {
    let topic = lines
        .last()
        .map(|l| extract_topic(&l.body))
        .unwrap_or_else(|| FALLBACK_TOPIC.to_string());
    let conflict_level = estimate_conflict(lines);
    MediationAssistantResult {
        conflict_level,
        deescalation_tips: tips_for(conflict_level, &topic),
    }
}
