//! Integration test: durable sled message store.
//!
//! Verifies that:
//! 1. Messages and threads survive closing and reopening the database.
//! 2. Duplicate and out-of-order chain positions are refused.
//! 3. Family listings span threads in time order.
//! 4. Tampering with a stored message is caught by chain verification.
//! 5. Threads whose ids share a prefix keep separate chains.
//! 6. Concurrent find-or-create of one subject agrees on a single thread.

#![cfg(feature = "sled-store")]

use hearth_core::chain::link;
use hearth_core::{ChainIssue, MessageChain, MessageStore, NewMessage, SledMessageStore, StoreError};
use std::sync::Arc;

fn new_message(thread: &str, body: &str) -> NewMessage {
    NewMessage::new(thread, "family-1", "parent-a", body)
}

#[tokio::test]
async fn chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages");

    let (thread_id, hashes) = {
        let store = Arc::new(SledMessageStore::open_path(&path).unwrap());
        let thread = store.find_or_create_thread("family-1", "Weekend plans").await.unwrap();
        let chain = MessageChain::new(store);
        let mut hashes = Vec::new();
        for body in ["a", "b", "c"] {
            let m = chain.append(new_message(&thread.id, body)).await.unwrap();
            hashes.push(m.message_hash);
        }
        (thread.id, hashes)
    };

    let store = Arc::new(SledMessageStore::open_path(&path).unwrap());
    let stored = store.messages_by_thread(&thread_id).await.unwrap();
    assert_eq!(
        stored.iter().map(|m| m.message_hash.clone()).collect::<Vec<_>>(),
        hashes
    );
    let thread = store.thread(&thread_id).await.unwrap().unwrap();
    assert_eq!(thread.subject, "Weekend plans");
    let again = store.find_or_create_thread("family-1", "weekend PLANS").await.unwrap();
    assert_eq!(again.id, thread_id);

    let chain = MessageChain::new(store.clone());
    assert!(chain.verify_thread(&thread_id).await.unwrap().valid);
    let next = chain.append(new_message(&thread_id, "d")).await.unwrap();
    assert_eq!(next.chain_index, 3);
    assert_eq!(next.previous_hash.as_deref(), hashes.last().map(String::as_str));
}

#[tokio::test]
async fn duplicate_and_gapped_positions_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledMessageStore::open_path(dir.path()).unwrap();

    let head = link(None, new_message("t1", "first"));
    store.append_message(&head).await.unwrap();

    let duplicate = link(None, new_message("t1", "also first"));
    let err = store.append_message(&duplicate).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { chain_index: 0, .. }));

    let second = link(Some(&head), new_message("t1", "second"));
    let third = link(Some(&second), new_message("t1", "third"));
    let err = store.append_message(&third).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Gap {
            chain_index: 2,
            expected: 1,
            ..
        }
    ));

    store.append_message(&second).await.unwrap();
    store.append_message(&third).await.unwrap();
    assert_eq!(store.last_message("t1").await.unwrap(), Some(third));
    assert_eq!(store.last_message("t2").await.unwrap(), None);
}

#[tokio::test]
async fn family_listing_spans_threads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledMessageStore::open_path(dir.path()).unwrap());
    let chain = MessageChain::new(store.clone());

    let school = store.find_or_create_thread("family-1", "School").await.unwrap();
    let money = store.find_or_create_thread("family-1", "Expenses").await.unwrap();
    let other = store.find_or_create_thread("family-2", "School").await.unwrap();
    assert_ne!(school.id, other.id);

    chain.append(new_message(&school.id, "Report cards are out")).await.unwrap();
    chain.append(new_message(&money.id, "Sent the dentist receipt")).await.unwrap();
    chain.append(new_message(&school.id, "Conference on Tuesday")).await.unwrap();
    chain
        .append(NewMessage::new(other.id.as_str(), "family-2", "parent-c", "unrelated"))
        .await
        .unwrap();

    let listed = store.messages_by_family("family-1").await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|m| m.family_id == "family-1"));
    assert!(listed.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
}

#[tokio::test]
async fn tampering_is_caught_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages");
    {
        let store = Arc::new(SledMessageStore::open_path(&path).unwrap());
        let chain = MessageChain::new(store.clone());
        for body in ["one", "two", "three"] {
            chain.append(new_message("t1", body)).await.unwrap();
        }
        let mut edited = store.messages_by_thread("t1").await.unwrap()[2].clone();
        edited.body = "I never agreed to that".to_string();
        store.replace_message(&edited).unwrap();
    }

    let store = Arc::new(SledMessageStore::open_path(&path).unwrap());
    let report = MessageChain::new(store).verify_thread("t1").await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_broken_index, Some(2));
    assert_eq!(report.issue, Some(ChainIssue::HashMismatch));
}

#[tokio::test]
async fn threads_sharing_an_id_prefix_stay_separate() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledMessageStore::open_path(dir.path()).unwrap());
    let chain = MessageChain::new(store.clone());

    chain.append(new_message("a/x", "nested")).await.unwrap();
    chain.append(new_message("ab", "sibling")).await.unwrap();
    let first = chain.append(new_message("a", "first of a")).await.unwrap();
    assert_eq!(first.chain_index, 0);
    assert_eq!(first.previous_hash, None);

    let listed = store.messages_by_thread("a").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].thread_id, "a");
    assert_eq!(store.last_message("a").await.unwrap(), Some(first));
    for thread in ["a", "a/x", "ab"] {
        assert!(chain.verify_thread(thread).await.unwrap().valid);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_find_or_create_agrees_on_one_thread() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledMessageStore::open_path(dir.path()).unwrap());

    for round in 0..25 {
        let subject = format!("Subject {}", round);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let subject = subject.clone();
            handles.push(tokio::spawn(async move {
                store.find_or_create_thread("family-1", &subject).await
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "round {} created more than one thread", round);
        assert!(store.thread(&ids[0]).await.unwrap().is_some());
    }

    let chain = MessageChain::new(store.clone());
    let thread = store.find_or_create_thread("family-1", "Subject 0").await.unwrap();
    chain.append(new_message(&thread.id, "hello")).await.unwrap();
    assert_eq!(store.messages_by_family("family-1").await.unwrap().len(), 1);
}
