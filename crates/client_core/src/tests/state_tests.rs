use super::*;

use chrono::TimeZone;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 11, minute, 0)
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

fn state_with(settings: StateSettings) -> ChannelState {
    ChannelState::new(Cid::new("messaging", "general"), UserId::from("me"), &settings)
}

fn state() -> ChannelState {
    state_with(StateSettings::default())
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn new_state_starts_at_the_newest_end() {
    let state = state();
    let flags = state.pagination();
    assert!(flags.end_of_newer);
    assert!(!flags.end_of_older);
    assert!(!flags.inside_search);
    assert!(!flags.recovery_needed);
}

#[test]
fn upserts_keep_creation_order_and_identity() {
    let mut state = state();
    state.upsert_messages(
        vec![message("c", "alice", 3), message("a", "alice", 1), message("b", "bob", 2)],
        false,
    );
    state.upsert_message(message("a", "alice", 1));
    assert_eq!(ids(state.messages()), vec!["a", "b", "c"]);
}

#[test]
fn pending_messages_sort_by_local_time() {
    let mut state = state();
    state.upsert_message(message("server", "alice", 5));
    state.upsert_message(Message {
        id: "local".into(),
        user: User::new("me"),
        sync_status: SyncStatus::SyncNeeded,
        created_locally_at: Some(at(3)),
        ..Message::default()
    });
    assert_eq!(ids(state.messages()), vec!["local", "server"]);
}

#[test]
fn replace_discards_previous_window() {
    let mut state = state();
    state.set_messages(vec![message("a", "alice", 1), message("b", "alice", 2)]);
    state.upsert_messages(vec![message("z", "alice", 9)], true);
    assert_eq!(ids(state.messages()), vec!["z"]);
}

#[test]
fn filters_hidden_thread_replies_and_foreign_shadowed_messages() {
    let mut state = state();
    let mut reply = message("reply", "alice", 1);
    reply.parent_id = Some("parent".into());
    let mut shown_reply = message("shown", "alice", 2);
    shown_reply.parent_id = Some("parent".into());
    shown_reply.show_in_channel = true;
    let mut shadowed = message("shadow", "troll", 3);
    shadowed.shadowed = true;
    let mut own_shadowed = message("mine", "me", 4);
    own_shadowed.shadowed = true;

    assert!(!state.upsert_message(reply));
    assert!(state.upsert_message(shown_reply));
    assert!(!state.upsert_message(shadowed));
    assert!(state.upsert_message(own_shadowed));
    assert_eq!(ids(state.messages()), vec!["shown", "mine"]);
}

#[test]
fn pending_copy_wins_by_local_timestamps() {
    let mut state = state();
    let mut stored = message("m1", "me", 1);
    stored.sync_status = SyncStatus::SyncNeeded;
    stored.created_locally_at = Some(at(1));
    stored.updated_locally_at = Some(at(4));
    state.upsert_message(stored);

    let mut older_local = message("m1", "me", 1);
    older_local.sync_status = SyncStatus::SyncNeeded;
    older_local.created_locally_at = Some(at(1));
    older_local.text = "older".into();
    assert!(!state.upsert_message(older_local));
}

#[test]
fn cached_tail_is_bounded() {
    let mut state = state_with(StateSettings {
        cached_latest_limit: 3,
        ..StateSettings::default()
    });
    for minute in 0..6 {
        state.upsert_cached_message(message(&format!("m{minute}"), "alice", minute));
    }
    assert_eq!(ids(state.cached_latest_messages()), vec!["m3", "m4", "m5"]);
}

#[test]
fn trimmed_messages_release_their_links() {
    let mut state = state_with(StateSettings {
        cached_latest_limit: 2,
        ..StateSettings::default()
    });
    let mut carrier = message("m0", "alice", 0);
    carrier.poll = Some(Poll {
        id: "p1".into(),
        ..Poll::default()
    });
    state.upsert_cached_message(carrier);
    let mut reply = message("m1", "alice", 1);
    reply.reply_message_id = Some("q".into());
    state.upsert_cached_message(reply);
    assert!(state.poll(&"p1".into()).is_some());

    for minute in 2..4 {
        state.upsert_cached_message(message(&format!("m{minute}"), "alice", minute));
    }

    assert_eq!(ids(state.cached_latest_messages()), vec!["m2", "m3"]);
    assert!(state.poll(&"p1".into()).is_none());
    assert!(state.replies_to(&"q".into()).is_none());
}

#[test]
fn replacing_the_window_keeps_links_of_messages_still_cached() {
    let mut state = state();
    let mut reply = message("r", "alice", 2);
    reply.reply_message_id = Some("q".into());
    state.set_messages(vec![message("q", "bob", 1), reply]);
    state.cache_latest_messages();

    state.set_messages(vec![message("old", "bob", 0)]);
    assert!(state.replies_to(&"q".into()).is_some());

    state.clear_cached_latest_messages();
    assert!(state.replies_to(&"q".into()).is_none());
}

#[test]
fn newer_pages_trim_oldest_messages() {
    let mut state = state_with(StateSettings {
        message_limit: Some(4),
        trim_buffer: 2,
        ..StateSettings::default()
    });
    state.set_end_of_older(true);
    state.set_messages((0..7).map(|i| message(&format!("m{i}"), "alice", i)).collect());

    state.trim_oldest_messages();
    assert_eq!(ids(state.messages()), vec!["m3", "m4", "m5", "m6"]);
    assert!(!state.pagination().end_of_older);
}

#[test]
fn trimming_is_disabled_without_limit() {
    let mut state = state();
    state.set_messages((0..50).map(|i| message(&format!("m{i}"), "alice", i)).collect());
    state.trim_newest_messages();
    assert_eq!(state.messages().len(), 50);
    assert!(state.pagination().end_of_newer);
}

#[test]
fn older_server_read_keeps_local_unread_count() {
    let mut state = state();
    state.increment_current_user_unread(at(10));
    state.increment_current_user_unread(at(11));

    state.update_read(ChannelUserRead {
        user: User::new("me"),
        last_received_event_date: Some(at(5)),
        unread_messages: 0,
        last_read: Some(at(5)),
        last_read_message_id: Some("m5".into()),
        ..ChannelUserRead::default()
    });

    let read = state.current_user_read().expect("read");
    assert_eq!(read.unread_messages, 2);
    assert_eq!(read.last_received_event_date, Some(at(11)));
    assert_eq!(read.last_read_message_id, Some("m5".into()));

    state.update_read(ChannelUserRead {
        user: User::new("me"),
        last_received_event_date: Some(at(20)),
        unread_messages: 0,
        ..ChannelUserRead::default()
    });
    assert_eq!(state.current_user_read().map(|r| r.unread_messages), Some(0));
}

#[test]
fn mark_read_moves_watermark_to_newest_message() {
    let mut state = state();
    assert!(state.mark_read(), "empty channel can still be marked read");

    state.set_messages(vec![message("m1", "alice", 1), message("m2", "alice", 2)]);
    state.increment_current_user_unread(at(2));
    assert!(state.mark_read());
    let read = state.current_user_read().expect("read");
    assert_eq!(read.unread_messages, 0);
    assert_eq!(read.last_read_message_id, Some("m2".into()));
    assert_eq!(read.last_read, Some(at(2)));

    assert!(!state.mark_read(), "already read up to the newest message");

    state.set_config(ChannelConfig {
        read_events_enabled: false,
        ..ChannelConfig::default()
    });
    assert!(!state.mark_read());
}

#[test]
fn watchers_and_member_counts() {
    let mut state = state();
    state.upsert_watcher(User::new("alice"), 1);
    state.upsert_watcher(User::new("bob"), 2);
    state.delete_watcher(&"alice".into(), 1);
    assert_eq!(state.watcher_count(), 1);
    assert_eq!(state.watchers().len(), 1);

    state.add_member(Member {
        user: User::new("alice"),
        ..Member::default()
    });
    state.add_member(Member {
        user: User::new("alice"),
        ..Member::default()
    });
    assert_eq!(state.member_count(), 1);
    state.delete_member(&"nobody".into());
    assert_eq!(state.member_count(), 1);
}

#[test]
fn last_message_at_only_moves_forward() {
    let mut state = state();
    state.update_last_message_at(&message("m2", "alice", 5));
    state.update_last_message_at(&message("m1", "alice", 2));
    assert_eq!(state.data().last_message_at, Some(at(5)));

    state.set_config(ChannelConfig {
        skip_last_msg_update_for_system_msgs: true,
        ..ChannelConfig::default()
    });
    let mut system = message("sys", "alice", 9);
    system.kind = shared::domain::MessageType::System;
    state.update_last_message_at(&system);
    assert_eq!(state.data().last_message_at, Some(at(5)));
}

#[tokio::test]
async fn subscribers_are_notified_of_changes() {
    let mut state = state();
    let mut changes = state.subscribe();

    state.upsert_message(message("m1", "alice", 1));
    state.set_loading_older(true);

    assert_eq!(changes.recv().await.expect("change"), ChannelStateChange::Messages);
    assert_eq!(changes.recv().await.expect("change"), ChannelStateChange::Pagination);
}
