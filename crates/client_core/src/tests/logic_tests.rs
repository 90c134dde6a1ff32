use super::*;

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use shared::domain::User;
use tokio::sync::Notify;

fn cid() -> Cid {
    Cid::new("messaging", "general")
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0)
        .single()
        .expect("timestamp")
}

fn fixed_clock() -> DateTime<Utc> {
    at(30)
}

fn message(id: &str, author: &str, minute: u32) -> Message {
    Message {
        id: id.into(),
        user: User::new(author),
        created_at: Some(at(minute)),
        ..Message::default()
    }
}

fn page(ids: &[(&str, u32)]) -> ChannelSnapshot {
    ChannelSnapshot {
        messages: ids
            .iter()
            .map(|(id, minute)| message(id, "alice", *minute))
            .collect(),
        ..ChannelSnapshot::empty(cid())
    }
}

#[derive(Default)]
struct FakeApi {
    responses: std::sync::Mutex<VecDeque<Result<ChannelSnapshot, ApiException>>>,
    requests: std::sync::Mutex<Vec<QueryChannelRequest>>,
}

impl FakeApi {
    fn with(responses: Vec<Result<ChannelSnapshot, ApiException>>) -> Arc<Self> {
        Arc::new(Self {
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::default(),
        })
    }

    fn requests(&self) -> Vec<QueryChannelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ChannelQueryApi for FakeApi {
    async fn query_channel(
        &self,
        _cid: &Cid,
        request: &QueryChannelRequest,
    ) -> Result<ChannelSnapshot, ApiException> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(ChannelSnapshot::empty(cid())))
    }
}

/// Holds every query until released.
#[derive(Default)]
struct GatedApi {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl ChannelQueryApi for GatedApi {
    async fn query_channel(
        &self,
        _cid: &Cid,
        _request: &QueryChannelRequest,
    ) -> Result<ChannelSnapshot, ApiException> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(page(&[("m1", 1)]))
    }
}

fn logic(api: Arc<dyn ChannelQueryApi>) -> ChannelLogic {
    ChannelLogic::new_with_dependencies(
        cid(),
        UserId::from("me"),
        &StateSettings::default(),
        api,
        Arc::new(StatusCodeClassifier),
        fixed_clock,
    )
}

fn new_message(message: Message) -> ChatEvent {
    ChatEvent::NewMessage {
        cid: cid(),
        created_at: message.created_at.unwrap_or_else(fixed_clock),
        message,
        channel_message_count: None,
    }
}

#[tokio::test]
async fn watch_loads_latest_page() {
    let api = FakeApi::with(vec![Ok(page(&[("m1", 1), ("m2", 2)]))]);
    let logic = logic(api.clone());

    logic.watch(30).await.expect("watch");

    assert_eq!(logic.messages().await.len(), 2);
    let flags = logic.pagination().await;
    assert!(flags.end_of_older);
    assert!(flags.end_of_newer);
    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].watch);
    assert!(requests[0].presence);
    assert_eq!(requests[0].direction(), QueryDirection::Latest);
}

#[tokio::test]
async fn concurrent_watch_is_rejected() {
    let api = Arc::new(GatedApi::default());
    let logic = Arc::new(logic(api.clone()));

    let first = tokio::spawn({
        let logic = logic.clone();
        async move { logic.watch(30).await }
    });
    api.started.notified().await;

    let second = logic.watch(30).await;
    assert!(matches!(second, Err(ChannelError::QueryInProgress(_))));

    api.release.notify_one();
    first.await.expect("join").expect("first watch");
    assert_eq!(logic.messages().await.len(), 1);

    api.release.notify_one();
    logic.watch(30).await.expect("watch after the first finished");
}

#[tokio::test]
async fn unread_buffer_is_paused_while_a_query_runs() {
    let api = Arc::new(GatedApi::default());
    let logic = Arc::new(logic(api.clone()));

    let pending = tokio::spawn({
        let logic = logic.clone();
        async move { logic.load_messages_around_id("m1".into(), 10).await }
    });
    api.started.notified().await;
    assert!(logic.unread.is_paused());

    api.release.notify_one();
    pending.await.expect("join").expect("around id");
    assert!(!logic.unread.is_paused());
}

#[tokio::test]
async fn older_and_newer_default_to_window_edges() {
    let api = FakeApi::with(vec![
        Ok(page(&[("m10", 10), ("m11", 11), ("m12", 12)])),
        Ok(page(&[("m5", 5)])),
        Ok(page(&[("m13", 13)])),
    ]);
    let logic = logic(api.clone());

    logic.watch(3).await.expect("watch");
    logic.load_older_messages(30, None).await.expect("older");
    logic.load_newer_messages(None, 30).await.expect("newer");

    let requests = api.requests();
    let older = requests[1].message_filter.as_ref().expect("older filter");
    assert_eq!(older.message_id.as_str(), "m10");
    assert_eq!(requests[1].direction(), QueryDirection::Older);
    let newer = requests[2].message_filter.as_ref().expect("newer filter");
    assert_eq!(newer.message_id.as_str(), "m12");
    assert_eq!(requests[2].direction(), QueryDirection::Newer);

    let ids: Vec<String> = logic
        .messages()
        .await
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["m5", "m10", "m11", "m12", "m13"]);
}

#[tokio::test]
async fn temporary_query_failure_flags_recovery() {
    let api = FakeApi::with(vec![Err(ApiException::new(ErrorCode::Timeout, "slow"))]);
    let logic = logic(api);

    let result = logic.load_older_messages(30, Some("m1".into())).await;

    assert!(matches!(result, Err(ChannelError::Query(_))));
    let flags = logic.pagination().await;
    assert!(flags.recovery_needed);
    assert!(!flags.loading_older);
    assert!(!logic.unread.is_paused());
}

#[tokio::test]
async fn events_for_other_channels_are_rejected() {
    let logic = logic(Arc::new(MissingChannelQueryApi));
    let event = ChatEvent::NewMessage {
        cid: Cid::new("messaging", "random"),
        created_at: at(1),
        message: message("m1", "alice", 1),
        channel_message_count: None,
    };

    let result = logic.handle_event(&event).await;
    assert!(matches!(result, Err(ChannelError::CidMismatch { .. })));
    assert!(logic.messages().await.is_empty());
}

#[tokio::test]
async fn new_messages_feed_the_unread_buffer() {
    let logic = logic(Arc::new(MissingChannelQueryApi));

    logic
        .handle_event(&new_message(message("m1", "alice", 1)))
        .await
        .expect("event");
    logic
        .handle_event(&new_message(message("m2", "me", 2)))
        .await
        .expect("event");
    logic
        .handle_event(&new_message(message("m3", "bob", 3)))
        .await
        .expect("event");
    logic.flush_unread().await;

    assert_eq!(logic.unread_count().await, 2);
    assert_eq!(logic.messages().await.len(), 3);

    assert!(logic.mark_read().await);
    assert_eq!(logic.unread_count().await, 0);
}

#[tokio::test]
async fn muted_channel_does_not_count_unread() {
    let logic = logic(Arc::new(MissingChannelQueryApi));
    logic
        .sync_mute_state(&[ChannelMute {
            channel_cid: cid(),
            created_at: None,
            expires: None,
        }])
        .await;

    logic
        .handle_event(&new_message(message("m1", "alice", 1)))
        .await
        .expect("event");
    logic.flush_unread().await;

    assert_eq!(logic.unread_count().await, 0);
    assert!(logic.state().lock().await.is_muted());
}

#[tokio::test]
async fn expired_mute_is_ignored() {
    let logic = logic(Arc::new(MissingChannelQueryApi));
    logic
        .sync_mute_state(&[ChannelMute {
            channel_cid: cid(),
            created_at: None,
            expires: Some(at(10)),
        }])
        .await;
    assert!(!logic.state().lock().await.is_muted());
}

#[tokio::test(start_paused = true)]
async fn typing_users_expire_without_a_stop_event() {
    let logic = logic(Arc::new(MissingChannelQueryApi));
    logic
        .handle_event(&ChatEvent::TypingStart {
            cid: cid(),
            created_at: at(1),
            user: User::new("alice"),
            parent_id: None,
        })
        .await
        .expect("typing start");
    assert!(logic
        .state()
        .lock()
        .await
        .typing()
        .is_typing(&UserId::from("alice")));

    tokio::time::sleep(Duration::from_millis(7_500)).await;

    let state = logic.state();
    let state = state.lock().await;
    assert!(state.typing().users.is_empty());
}

#[tokio::test]
async fn local_snapshot_for_another_channel_is_rejected() {
    let logic = logic(Arc::new(MissingChannelQueryApi));
    let snapshot = ChannelSnapshot::empty(Cid::new("messaging", "random"));
    assert!(matches!(
        logic.apply_local_snapshot(snapshot).await,
        Err(ChannelError::CidMismatch { .. })
    ));
    logic
        .apply_local_snapshot(page(&[("m1", 1)]))
        .await
        .expect("local snapshot");
    assert_eq!(logic.messages().await.len(), 1);
}
