use super::*;

use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{User, UserId};

use crate::config::StateSettings;

fn cid() -> Cid {
    Cid::new("messaging", "general")
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0)
        .single()
        .expect("timestamp")
}

fn message(id: &str, author: &str, minute: u32) -> Message {
    Message {
        id: id.into(),
        user: User::new(author),
        created_at: Some(at(minute)),
        ..Message::default()
    }
}

fn shared_state() -> Arc<Mutex<ChannelState>> {
    Arc::new(Mutex::new(ChannelState::new(
        cid(),
        UserId::from("me"),
        &StateSettings::default(),
    )))
}

async fn unread_count(state: &Arc<Mutex<ChannelState>>) -> u32 {
    state
        .lock()
        .await
        .current_user_read()
        .map_or(0, |read| read.unread_messages)
}

#[tokio::test]
async fn message_from_other_user_increments_by_one() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.increment_unread_count_if_necessary(message("m1", "alice", 1));
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 1);
    let guard = state.lock().await;
    let read = guard.current_user_read().expect("read created");
    assert_eq!(read.last_received_event_date, Some(at(1)));
}

#[tokio::test]
async fn own_messages_never_count() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.increment_unread_count_if_necessary(message("m1", "me", 1));
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 0);
}

#[tokio::test]
async fn duplicate_and_older_messages_are_not_counted_twice() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.increment_unread_count_if_necessary(message("m2", "alice", 2));
    buffer.increment_unread_count_if_necessary(message("m2", "alice", 2));
    buffer.increment_unread_count_if_necessary(message("m1", "bob", 1));
    buffer.increment_unread_count_if_necessary(message("m3", "bob", 3));
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 2);
}

#[tokio::test]
async fn muted_channel_does_not_count() {
    let state = shared_state();
    state.lock().await.set_muted(true);
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.increment_unread_count_if_necessary(message("m1", "alice", 1));
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 0);
}

#[tokio::test]
async fn paused_buffer_defers_without_dropping() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.pause();
    assert!(buffer.is_paused());
    buffer.increment_unread_count_if_necessary(message("m1", "alice", 1));
    buffer.increment_unread_count_if_necessary(message("m2", "alice", 2));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(unread_count(&state).await, 0);

    buffer.resume();
    buffer.flush().await;
    assert_eq!(unread_count(&state).await, 2);
}

#[tokio::test]
async fn snapshot_applied_while_paused_absorbs_queued_messages() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.pause();
    buffer.increment_unread_count_if_necessary(message("m1", "alice", 1));
    {
        let mut guard = state.lock().await;
        guard.update_read(shared::domain::ChannelUserRead {
            user: User::new("me"),
            last_received_event_date: Some(at(1)),
            unread_messages: 1,
            ..Default::default()
        });
    }
    buffer.resume();
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 1);
}

#[tokio::test]
async fn concurrent_producers_are_serialized() {
    let state = shared_state();
    let buffer = Arc::new(UnreadCountBuffer::spawn(cid(), state.clone()));

    let mut producers = Vec::new();
    for minute in 1..=20u32 {
        let buffer = buffer.clone();
        producers.push(tokio::spawn(async move {
            buffer.increment_unread_count_if_necessary(message(
                &format!("m{minute}"),
                "alice",
                minute,
            ));
        }));
    }
    for producer in producers {
        producer.await.expect("producer");
    }
    buffer.flush().await;

    let count = unread_count(&state).await;
    assert!(count >= 1 && count <= 20, "count {count}");
    let guard = state.lock().await;
    let read = guard.current_user_read().expect("read");
    assert_eq!(read.unread_messages, count);
}

#[tokio::test]
async fn distinct_messages_sharing_a_timestamp_each_count() {
    let state = shared_state();
    let buffer = UnreadCountBuffer::spawn(cid(), state.clone());

    buffer.increment_unread_count_if_necessary(message("m1", "alice", 4));
    buffer.increment_unread_count_if_necessary(message("m2", "bob", 4));
    buffer.increment_unread_count_if_necessary(message("m2", "bob", 4));
    buffer.flush().await;

    assert_eq!(unread_count(&state).await, 2);
}

#[test]
fn tracker_forgets_the_oldest_ids_past_capacity() {
    let mut state = ChannelState::new(cid(), UserId::from("me"), &StateSettings::default());
    let mut tracker = UnreadTracker::new(2);

    assert!(tracker.count_if_necessary(&cid(), &mut state, &message("m1", "alice", 1)));
    assert!(tracker.count_if_necessary(&cid(), &mut state, &message("m2", "alice", 2)));
    assert!(!tracker.count_if_necessary(&cid(), &mut state, &message("m2", "alice", 2)));
    assert!(tracker.count_if_necessary(&cid(), &mut state, &message("m3", "alice", 3)));
    assert_eq!(tracker.order.len(), 2);
    assert!(!tracker.processed.contains(&MessageId::from("m1")));

    // m1 is forgotten but still older than the watermark.
    assert!(!tracker.count_if_necessary(&cid(), &mut state, &message("m1", "alice", 1)));
    assert_eq!(state.current_user_read().map(|read| read.unread_messages), Some(3));
}
