//! Hash-linked message history per thread.
//!
//! `message_hash` is SHA-256 (lowercase hex) over the fields below, each written as an
//! 8-byte big-endian length followed by its UTF-8 bytes:
//!
//! | # | Field | Rendering |
//! |---|-------|-----------|
//! | 1 | thread_id | as is |
//! | 2 | family_id | as is |
//! | 3 | sender_id | as is |
//! | 4 | body | as is |
//! | 5 | sent_at | RFC 3339, UTC, milliseconds, `Z` suffix |
//! | 6 | chain_index | decimal |
//! | 7 | previous_hash | as is, zero-length when absent |

use crate::error::ChainError;
use crate::shared::{Message, ToneAnalysis};
use crate::store::MessageStore;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

fn write_field(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field);
}

pub fn compute_message_hash(
    thread_id: &str,
    family_id: &str,
    sender_id: &str,
    body: &str,
    sent_at: &DateTime<Utc>,
    chain_index: u64,
    previous_hash: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, thread_id.as_bytes());
    write_field(&mut hasher, family_id.as_bytes());
    write_field(&mut hasher, sender_id.as_bytes());
    write_field(&mut hasher, body.as_bytes());
    write_field(
        &mut hasher,
        sent_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .as_bytes(),
    );
    write_field(&mut hasher, chain_index.to_string().as_bytes());
    write_field(&mut hasher, previous_hash.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Recompute a stored message's hash from its own fields.
pub fn hash_of(message: &Message) -> String {
    compute_message_hash(
        &message.thread_id,
        &message.family_id,
        &message.sender_id,
        &message.body,
        &message.sent_at,
        message.chain_index,
        message.previous_hash.as_deref(),
    )
}

/// Everything about a message except its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub thread_id: String,
    pub family_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub attachment_ids: Vec<String>,
    pub tone_analysis: ToneAnalysis,
}

impl NewMessage {
    pub fn new(
        thread_id: impl Into<String>,
        family_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            family_id: family_id.into(),
            sender_id: sender_id.into(),
            body: body.into(),
            sent_at: Utc::now(),
            attachment_ids: Vec::new(),
            tone_analysis: ToneAnalysis::default(),
        }
    }
}

/// Place `new` after `previous` (or at the head of the chain) and seal it.
///
/// `sent_at` is truncated to milliseconds so the stored timestamp and the hashed rendering
/// agree.
pub fn link(previous: Option<&Message>, new: NewMessage) -> Message {
    let chain_index = previous.map_or(0, |p| p.chain_index + 1);
    let previous_hash = previous.map(|p| p.message_hash.clone());
    let sent_at = new.sent_at.trunc_subsecs(3);
    let message_hash = compute_message_hash(
        &new.thread_id,
        &new.family_id,
        &new.sender_id,
        &new.body,
        &sent_at,
        chain_index,
        previous_hash.as_deref(),
    );
    Message {
        id: uuid::Uuid::new_v4().to_string(),
        thread_id: new.thread_id,
        family_id: new.family_id,
        sender_id: new.sender_id,
        body: new.body,
        sent_at,
        read_at: None,
        attachment_ids: new.attachment_ids,
        tone_analysis: new.tone_analysis,
        message_hash,
        previous_hash,
        chain_index,
    }
}

/// First defect found while walking a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainIssue {
    /// `chain_index` does not equal the message's position.
    IndexGap,
    /// `previous_hash` does not match the prior message's `message_hash`.
    PreviousHashMismatch,
    /// Recomputing the hash does not reproduce `message_hash`.
    HashMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub thread_id: String,
    pub length: usize,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<ChainIssue>,
}

/// Walk `messages` (ordered by `chain_index`) and report the first broken link.
pub fn verify_messages(thread_id: &str, messages: &[Message]) -> ChainReport {
    let mut report = ChainReport {
        thread_id: thread_id.to_string(),
        length: messages.len(),
        valid: true,
        first_broken_index: None,
        issue: None,
    };

    let mut previous: Option<&Message> = None;
    for (position, message) in messages.iter().enumerate() {
        let issue = if message.chain_index != position as u64 {
            Some(ChainIssue::IndexGap)
        } else if message.previous_hash.as_deref() != previous.map(|p| p.message_hash.as_str()) {
            Some(ChainIssue::PreviousHashMismatch)
        } else if hash_of(message) != message.message_hash {
            Some(ChainIssue::HashMismatch)
        } else {
            None
        };

        if let Some(issue) = issue {
            report.valid = false;
            report.first_broken_index = Some(position as u64);
            report.issue = Some(issue);
            break;
        }
        previous = Some(message);
    }
    report
}

/// Appends to threads through a per-thread lock so concurrent sends get distinct,
/// contiguous positions.
pub struct MessageChain {
    store: Arc<dyn MessageStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MessageChain {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the thread's lock entry once no appender holds or waits on it. Waiters clone the
    /// Arc under the map's shard lock, so a count of one means the map is the only owner.
    fn release_lock(&self, thread_id: &str) {
        self.locks
            .remove_if(thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of threads with a live append lock.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    async fn link_and_store(&self, new: NewMessage) -> Result<Message, ChainError> {
        let previous = self.store.last_message(&new.thread_id).await?;
        let message = link(previous.as_ref(), new);
        self.store.append_message(&message).await?;
        Ok(message)
    }

    /// Link `new` after the thread's current tail and persist it. The lock is held from the
    /// tail read through the store write.
    pub async fn append(&self, new: NewMessage) -> Result<Message, ChainError> {
        let thread_id = new.thread_id.clone();
        let lock = self.thread_lock(&thread_id);
        let result = {
            let _held = lock.lock().await;
            self.link_and_store(new).await
        };
        drop(lock);
        self.release_lock(&thread_id);
        let message = result?;

        tracing::debug!(
            thread_id = %message.thread_id,
            chain_index = message.chain_index,
            message_id = %message.id,
            "message appended to chain"
        );
        Ok(message)
    }

    pub async fn verify_thread(&self, thread_id: &str) -> Result<ChainReport, ChainError> {
        let messages = self.store.messages_by_thread(thread_id).await?;
        let report = verify_messages(thread_id, &messages);
        if !report.valid {
            tracing::warn!(
                thread_id = %thread_id,
                first_broken_index = report.first_broken_index,
                issue = ?report.issue,
                "chain verification failed"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_767_225_600_000 + ms).unwrap()
    }

    fn draft(body: &str, sent_at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            sent_at,
            ..NewMessage::new("t1", "f1", "parent-a", body)
        }
    }

    fn chain_of(n: usize) -> Vec<Message> {
        let mut out: Vec<Message> = Vec::new();
        for i in 0..n {
            let m = link(out.last(), draft(&format!("msg {}", i), at(i as i64 * 1000)));
            out.push(m);
        }
        out
    }

    #[test]
    fn hash_is_lowercase_sha256_hex() {
        let h = compute_message_hash("t", "f", "s", "b", &at(0), 0, None);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = compute_message_hash("ab", "c", "s", "b", &at(0), 0, None);
        let b = compute_message_hash("a", "bc", "s", "b", &at(0), 0, None);
        assert_ne!(a, b);
    }

    #[test]
    fn absent_previous_differs_from_nothing_else() {
        let none = compute_message_hash("t", "f", "s", "b", &at(0), 1, None);
        let some = compute_message_hash("t", "f", "s", "b", &at(0), 1, Some("00"));
        assert_ne!(none, some);
    }

    #[test]
    fn first_link_has_no_previous() {
        let m = link(None, draft("hello", at(0)));
        assert_eq!(m.chain_index, 0);
        assert!(m.previous_hash.is_none());
        assert_eq!(hash_of(&m), m.message_hash);
    }

    #[test]
    fn links_point_at_the_previous_hash() {
        let chain = chain_of(3);
        assert_eq!(chain[1].previous_hash.as_deref(), Some(chain[0].message_hash.as_str()));
        assert_eq!(chain[2].previous_hash.as_deref(), Some(chain[1].message_hash.as_str()));
        assert_eq!(chain[2].chain_index, 2);
    }

    #[test]
    fn sub_millisecond_time_is_truncated_before_hashing() {
        let precise = at(0) + chrono::Duration::microseconds(1234);
        let m = link(None, draft("x", precise));
        assert_eq!(m.sent_at, at(1));
        // Round-trip through JSON keeps the hash reproducible.
        let back: Message = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(hash_of(&back), m.message_hash);
    }

    #[test]
    fn intact_chain_verifies() {
        let report = verify_messages("t1", &chain_of(4));
        assert!(report.valid);
        assert_eq!(report.length, 4);
        assert_eq!(report.first_broken_index, None);
        assert!(verify_messages("t1", &[]).valid);
    }

    #[test]
    fn edited_body_is_detected() {
        let mut chain = chain_of(3);
        chain[1].body = "I never said that".to_string();
        let report = verify_messages("t1", &chain);
        assert!(!report.valid);
        assert_eq!(report.first_broken_index, Some(1));
        assert_eq!(report.issue, Some(ChainIssue::HashMismatch));
    }

    #[test]
    fn removed_message_is_detected() {
        let mut chain = chain_of(3);
        chain.remove(1);
        let report = verify_messages("t1", &chain);
        assert_eq!(report.first_broken_index, Some(1));
        assert_eq!(report.issue, Some(ChainIssue::IndexGap));
    }

    #[test]
    fn rewritten_link_is_detected() {
        let mut chain = chain_of(3);
        chain[2].previous_hash = Some("0".repeat(64));
        let report = verify_messages("t1", &chain);
        assert_eq!(report.first_broken_index, Some(2));
        assert_eq!(report.issue, Some(ChainIssue::PreviousHashMismatch));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn append_locks_are_released_once_idle() {
        let chain = Arc::new(MessageChain::new(Arc::new(crate::store::MemoryMessageStore::new())));
        let mut handles = Vec::new();
        for i in 0..16 {
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                let thread = format!("t{}", i % 4);
                chain
                    .append(NewMessage::new(thread.as_str(), "f1", "parent-a", "hello"))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(chain.active_locks(), 0);
        for t in ["t0", "t1", "t2", "t3"] {
            let report = chain.verify_thread(t).await.unwrap();
            assert!(report.valid);
            assert_eq!(report.length, 4);
        }
    }
}
