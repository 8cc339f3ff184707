//! Message persistence: an async store trait with an in-memory (DashMap) and a durable
//! (sled) implementation.
//!
//! Both implementations refuse to store a message at a `(thread, chain_index)` position that
//! is already taken or that would leave a gap, so a racing writer is detected instead of
//! forking the chain.

use crate::error::{StoreError, StoreResult};
use crate::shared::{Message, Thread};
use chrono::Utc;
use dashmap::DashMap;

fn subject_key(family_id: &str, subject: &str) -> String {
    format!("{}\u{0}{}", family_id, subject.trim().to_lowercase())
}

fn new_thread(family_id: &str, subject: &str) -> Thread {
    Thread {
        id: uuid::Uuid::new_v4().to_string(),
        family_id: family_id.to_string(),
        subject: subject.trim().to_string(),
        created_at: Utc::now(),
    }
}

fn sort_family_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.sent_at
            .cmp(&b.sent_at)
            .then_with(|| a.thread_id.cmp(&b.thread_id))
            .then_with(|| a.chain_index.cmp(&b.chain_index))
    });
}

/// Persistence collaborator for threads and their messages.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Store `message` at its `chain_index`. Fails with `Conflict` if the position is taken
    /// and `Gap` if earlier positions are missing.
    async fn append_message(&self, message: &Message) -> StoreResult<()>;

    /// All messages of a thread ordered by `chain_index` (empty for an unknown thread).
    async fn messages_by_thread(&self, thread_id: &str) -> StoreResult<Vec<Message>>;

    async fn last_message(&self, thread_id: &str) -> StoreResult<Option<Message>> {
        Ok(self.messages_by_thread(thread_id).await?.pop())
    }

    /// All messages of a family across threads, ordered by `sent_at`.
    async fn messages_by_family(&self, family_id: &str) -> StoreResult<Vec<Message>>;

    /// The family's thread with this subject (trimmed, case-insensitive), created if absent.
    async fn find_or_create_thread(&self, family_id: &str, subject: &str) -> StoreResult<Thread>;

    async fn thread(&self, thread_id: &str) -> StoreResult<Option<Thread>>;
}

/// Ephemeral store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryMessageStore {
    threads: DashMap<String, Thread>,
    subjects: DashMap<String, String>,
    messages: DashMap<String, Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored message in place. Only for exercising tamper detection.
    #[cfg(any(test, feature = "test-util"))]
    pub fn replace_message(&self, message: Message) -> bool {
        match self.messages.get_mut(&message.thread_id) {
            Some(mut list) => match list.get_mut(message.chain_index as usize) {
                Some(slot) => {
                    *slot = message;
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append_message(&self, message: &Message) -> StoreResult<()> {
        let mut list = self.messages.entry(message.thread_id.clone()).or_default();
        let expected = list.len() as u64;
        if message.chain_index < expected {
            return Err(StoreError::Conflict {
                thread_id: message.thread_id.clone(),
                chain_index: message.chain_index,
            });
        }
        if message.chain_index > expected {
            return Err(StoreError::Gap {
                thread_id: message.thread_id.clone(),
                chain_index: message.chain_index,
                expected,
            });
        }
        list.push(message.clone());
        Ok(())
    }

    async fn messages_by_thread(&self, thread_id: &str) -> StoreResult<Vec<Message>> {
        Ok(self
            .messages
            .get(thread_id)
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn last_message(&self, thread_id: &str) -> StoreResult<Option<Message>> {
        Ok(self
            .messages
            .get(thread_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn messages_by_family(&self, family_id: &str) -> StoreResult<Vec<Message>> {
        let mut out: Vec<Message> = self
            .messages
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|m| m.family_id == family_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        sort_family_messages(&mut out);
        Ok(out)
    }

    async fn find_or_create_thread(&self, family_id: &str, subject: &str) -> StoreResult<Thread> {
        let id = self
            .subjects
            .entry(subject_key(family_id, subject))
            .or_insert_with(|| {
                let thread = new_thread(family_id, subject);
                let id = thread.id.clone();
                self.threads.insert(id.clone(), thread);
                id
            })
            .clone();
        self.threads
            .get(&id)
            .map(|t| t.clone())
            .ok_or(StoreError::ThreadNotFound(id))
    }

    async fn thread(&self, thread_id: &str) -> StoreResult<Option<Thread>> {
        Ok(self.threads.get(thread_id).map(|t| t.clone()))
    }
}

#[cfg(feature = "sled-store")]
pub use durable::SledMessageStore;

#[cfg(feature = "sled-store")]
mod durable {
    use super::*;
    use sled::{Db, Tree};
    use std::path::Path;

    const MESSAGES_TREE: &str = "messages";
    const THREADS_TREE: &str = "threads";
    const SUBJECTS_TREE: &str = "thread_subjects";
    const FAMILY_THREADS_TREE: &str = "family_threads";

    /// Length-prefixed so no thread's key range can contain another thread's keys.
    fn message_prefix(thread_id: &str) -> String {
        format!("{:010}:{}\u{0}", thread_id.len(), thread_id)
    }

    fn message_key(thread_id: &str, chain_index: u64) -> String {
        format!("{}{:020}", message_prefix(thread_id), chain_index)
    }

    fn family_thread_key(family_id: &str, thread_id: &str) -> String {
        format!("{}\u{0}{}", family_id, thread_id)
    }

    /// Durable store on sled. Messages live in one tree keyed
    /// `{len(thread):010}:{thread}\0{index:020}` so a prefix scan yields exactly one thread's
    /// messages in chain order.
    pub struct SledMessageStore {
        db: Db,
        messages: Tree,
        threads: Tree,
        subjects: Tree,
        family_threads: Tree,
    }

    impl SledMessageStore {
        pub fn open_path<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
            let db = sled::open(path)?;
            Ok(Self {
                messages: db.open_tree(MESSAGES_TREE)?,
                threads: db.open_tree(THREADS_TREE)?,
                subjects: db.open_tree(SUBJECTS_TREE)?,
                family_threads: db.open_tree(FAMILY_THREADS_TREE)?,
                db,
            })
        }

        fn next_index(&self, thread_id: &str) -> StoreResult<u64> {
            match self.messages.scan_prefix(message_prefix(thread_id)).next_back() {
                Some(entry) => {
                    let (_, bytes) = entry?;
                    let last: Message = serde_json::from_slice(&bytes)?;
                    Ok(last.chain_index + 1)
                }
                None => Ok(0),
            }
        }

        fn load_messages(&self, thread_id: &str) -> StoreResult<Vec<Message>> {
            self.messages
                .scan_prefix(message_prefix(thread_id))
                .map(|entry| -> StoreResult<Message> {
                    let (_, bytes) = entry?;
                    Ok(serde_json::from_slice(&bytes)?)
                })
                .collect()
        }

        fn load_thread(&self, thread_id: &str) -> StoreResult<Option<Thread>> {
            match self.threads.get(thread_id.as_bytes())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        }

        /// Overwrite a stored message in place. Only for exercising tamper detection.
        #[cfg(any(test, feature = "test-util"))]
        pub fn replace_message(&self, message: &Message) -> StoreResult<()> {
            let bytes = serde_json::to_vec(message)?;
            self.messages
                .insert(message_key(&message.thread_id, message.chain_index), bytes)?;
            self.db.flush()?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MessageStore for SledMessageStore {
        async fn append_message(&self, message: &Message) -> StoreResult<()> {
            let expected = self.next_index(&message.thread_id)?;
            if message.chain_index > expected {
                return Err(StoreError::Gap {
                    thread_id: message.thread_id.clone(),
                    chain_index: message.chain_index,
                    expected,
                });
            }

            let bytes = serde_json::to_vec(message)?;
            let key = message_key(&message.thread_id, message.chain_index);
            if self
                .messages
                .compare_and_swap(key, None::<&[u8]>, Some(bytes))?
                .is_err()
            {
                return Err(StoreError::Conflict {
                    thread_id: message.thread_id.clone(),
                    chain_index: message.chain_index,
                });
            }
            self.db.flush_async().await?;

            tracing::debug!(
                thread_id = %message.thread_id,
                chain_index = message.chain_index,
                "message persisted"
            );
            Ok(())
        }

        async fn messages_by_thread(&self, thread_id: &str) -> StoreResult<Vec<Message>> {
            self.load_messages(thread_id)
        }

        async fn last_message(&self, thread_id: &str) -> StoreResult<Option<Message>> {
            match self.messages.scan_prefix(message_prefix(thread_id)).next_back() {
                Some(entry) => {
                    let (_, bytes) = entry?;
                    Ok(Some(serde_json::from_slice(&bytes)?))
                }
                None => Ok(None),
            }
        }

        async fn messages_by_family(&self, family_id: &str) -> StoreResult<Vec<Message>> {
            let mut out = Vec::new();
            let prefix = family_thread_key(family_id, "");
            for entry in self.family_threads.scan_prefix(prefix.as_bytes()) {
                let (_, thread_id) = entry?;
                out.extend(self.load_messages(&String::from_utf8_lossy(&thread_id))?);
            }
            sort_family_messages(&mut out);
            Ok(out)
        }

        async fn find_or_create_thread(&self, family_id: &str, subject: &str) -> StoreResult<Thread> {
            let key = subject_key(family_id, subject);
            if let Some(id) = self.subjects.get(key.as_bytes())? {
                let id = String::from_utf8_lossy(&id).into_owned();
                return self
                    .load_thread(&id)?
                    .ok_or(StoreError::ThreadNotFound(id));
            }

            // The record and family index go in before the subject is claimed, so whoever
            // sees the claim can also load the thread.
            let thread = new_thread(family_id, subject);
            let family_key = family_thread_key(family_id, &thread.id);
            self.threads
                .insert(thread.id.as_bytes(), serde_json::to_vec(&thread)?)?;
            self.family_threads
                .insert(family_key.as_bytes(), thread.id.as_bytes())?;

            let claimed = self.subjects.compare_and_swap(
                key.as_bytes(),
                None::<&[u8]>,
                Some(thread.id.as_bytes()),
            )?;
            if let Err(lost) = claimed {
                self.threads.remove(thread.id.as_bytes())?;
                self.family_threads.remove(family_key.as_bytes())?;
                let id = lost
                    .current
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                return self
                    .load_thread(&id)?
                    .ok_or(StoreError::ThreadNotFound(id));
            }

            self.db.flush_async().await?;
            tracing::info!(
                family_id = %family_id,
                thread_id = %thread.id,
                "thread created"
            );
            Ok(thread)
        }

        async fn thread(&self, thread_id: &str) -> StoreResult<Option<Thread>> {
            self.load_thread(thread_id)
        }
    }
}
