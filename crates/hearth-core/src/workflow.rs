//! Message submission: validate, screen for hostility, then link and persist.
//!
//! ```text
//! Drafted -> Validated -> ToneChecked -> Blocked
//!                                     -> Linked -> Persisted
//! ```
//! A draft that fails validation (or is refused under the fail-closed policy) is returned
//! as `Rejected`; the caller keeps the draft in every non-sent outcome.

use crate::chain::{MessageChain, NewMessage};
use crate::config::FailurePolicy;
use crate::error::WorkflowError;
use crate::moderation::{FallbackReason, ToneClassifier};
use crate::shared::Message;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest accepted body, in Unicode scalar values after trimming.
pub const MAX_BODY_CHARS: usize = 2000;

/// A message as composed by the sender, before any checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub thread_id: String,
    pub family_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Drafted,
    Validated,
    ToneChecked,
    Blocked,
    Linked,
    Persisted,
    Rejected,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Validated => "validated",
            Self::ToneChecked => "tone_checked",
            Self::Blocked => "blocked",
            Self::Linked => "linked",
            Self::Persisted => "persisted",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    Empty,
    TooLong {
        #[serde(rename = "maxChars")]
        max_chars: usize,
        #[serde(rename = "actualChars")]
        actual_chars: usize,
    },
    /// Fail-closed policy and no classifier verdict was available.
    ModerationUnavailable,
}

/// Result of a submission that did not fail on persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SubmissionOutcome {
    /// Hostile verdict; nothing was stored.
    Blocked {
        draft: Draft,
        indicators: Vec<String>,
        neutral_rewrite: String,
    },
    Sent {
        message: Message,
        /// Set when the message was delivered without a classifier verdict (fail-open).
        #[serde(skip_serializing_if = "Option::is_none")]
        moderation_fallback: Option<FallbackReason>,
    },
    /// Correctable input problem; nothing was stored.
    Rejected { draft: Draft, reason: RejectionReason },
}

impl SubmissionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::Sent { .. } => "sent",
            Self::Rejected { .. } => "rejected",
        }
    }
}

fn transition(draft: &Draft, to: SubmissionState) {
    tracing::debug!(
        thread_id = %draft.thread_id,
        sender_id = %draft.sender_id,
        state = to.as_str(),
        "submission state"
    );
}

/// Drives a draft through the submission states.
pub struct MessageSubmissionWorkflow {
    tone: Arc<ToneClassifier>,
    chain: Arc<MessageChain>,
    failure_policy: FailurePolicy,
}

impl MessageSubmissionWorkflow {
    pub fn new(tone: Arc<ToneClassifier>, chain: Arc<MessageChain>, failure_policy: FailurePolicy) -> Self {
        Self {
            tone,
            chain,
            failure_policy,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Only a persistence failure is an error; every other result is an outcome.
    pub async fn submit(&self, draft: Draft) -> Result<SubmissionOutcome, WorkflowError> {
        transition(&draft, SubmissionState::Drafted);

        let body = draft.body.trim();
        if body.is_empty() {
            return Ok(reject(draft, RejectionReason::Empty));
        }
        let actual_chars = body.chars().count();
        if actual_chars > MAX_BODY_CHARS {
            return Ok(reject(
                draft,
                RejectionReason::TooLong {
                    max_chars: MAX_BODY_CHARS,
                    actual_chars,
                },
            ));
        }
        let body = body.to_string();
        transition(&draft, SubmissionState::Validated);

        let verdict = self.tone.classify(&draft.sender_id, &body).await;
        transition(&draft, SubmissionState::ToneChecked);

        if let Some(reason) = verdict.fallback {
            if self.failure_policy == FailurePolicy::FailClosed {
                tracing::warn!(
                    thread_id = %draft.thread_id,
                    reason = reason.label(),
                    "moderation unavailable; refusing draft under fail-closed policy"
                );
                return Ok(reject(draft, RejectionReason::ModerationUnavailable));
            }
            tracing::info!(
                thread_id = %draft.thread_id,
                reason = reason.label(),
                "moderation unavailable; delivering unscreened"
            );
        }

        let tone = verdict.value;
        if tone.is_hostile {
            transition(&draft, SubmissionState::Blocked);
            return Ok(SubmissionOutcome::Blocked {
                draft,
                indicators: tone.indicators,
                neutral_rewrite: tone.neutral_rewrite,
            });
        }

        let new = NewMessage {
            thread_id: draft.thread_id.clone(),
            family_id: draft.family_id.clone(),
            sender_id: draft.sender_id.clone(),
            body,
            sent_at: Utc::now(),
            attachment_ids: draft.attachment_ids.clone(),
            tone_analysis: tone.to_analysis(),
        };
        transition(&draft, SubmissionState::Linked);
        let message = self.chain.append(new).await.map_err(|e| {
            tracing::error!(thread_id = %draft.thread_id, error = %e, "message persistence failed");
            WorkflowError::from(e)
        })?;
        transition(&draft, SubmissionState::Persisted);

        Ok(SubmissionOutcome::Sent {
            message,
            moderation_fallback: verdict.fallback,
        })
    }
}

fn reject(draft: Draft, reason: RejectionReason) -> SubmissionOutcome {
    transition(&draft, SubmissionState::Rejected);
    SubmissionOutcome::Rejected { draft, reason }
}
