use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelMute, Cid, Message, MessageId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{ChannelSnapshot, ChatEvent, QueryChannelRequest, QueryDirection},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::StateSettings,
    error::{ChannelError, ErrorClassifier, StatusCodeClassifier},
    handler::{ChannelEventHandler, Clock},
    query,
    state::{ChannelState, ChannelStateChange, PaginationFlags},
    typing::{TypingEventPruner, TypingExpiry},
    unread::UnreadCountBuffer,
};

/// The query layer this core talks to. Implementations own transport,
/// retries and request deduplication.
#[async_trait]
pub trait ChannelQueryApi: Send + Sync {
    async fn query_channel(
        &self,
        cid: &Cid,
        request: &QueryChannelRequest,
    ) -> Result<ChannelSnapshot, ApiException>;
}

pub struct MissingChannelQueryApi;

#[async_trait]
impl ChannelQueryApi for MissingChannelQueryApi {
    async fn query_channel(
        &self,
        _cid: &Cid,
        _request: &QueryChannelRequest,
    ) -> Result<ChannelSnapshot, ApiException> {
        Err(ApiException::new(
            ErrorCode::Internal,
            "channel query api is not configured",
        ))
    }
}

/// Entry point for one channel: routes push events to the reconciler,
/// issues page requests and folds their results into the shared state.
///
/// Locks are always taken events first, then state. No lock is held while
/// a query is awaited.
pub struct ChannelLogic {
    cid: Cid,
    state: Arc<Mutex<ChannelState>>,
    events: Arc<Mutex<ChannelEventHandler>>,
    unread: UnreadCountBuffer,
    api: Arc<dyn ChannelQueryApi>,
    classifier: Arc<dyn ErrorClassifier>,
    watch_in_flight: AtomicBool,
    queries_in_flight: AtomicUsize,
    typing_expiry: JoinHandle<()>,
}

impl ChannelLogic {
    /// Must be called inside a tokio runtime.
    pub fn new(
        cid: Cid,
        current_user_id: UserId,
        settings: &StateSettings,
        api: Arc<dyn ChannelQueryApi>,
    ) -> Self {
        Self::new_with_dependencies(
            cid,
            current_user_id,
            settings,
            api,
            Arc::new(StatusCodeClassifier),
            chrono::Utc::now,
        )
    }

    pub fn new_with_dependencies(
        cid: Cid,
        current_user_id: UserId,
        settings: &StateSettings,
        api: Arc<dyn ChannelQueryApi>,
        classifier: Arc<dyn ErrorClassifier>,
        clock: Clock,
    ) -> Self {
        let state = Arc::new(Mutex::new(ChannelState::new(
            cid.clone(),
            current_user_id.clone(),
            settings,
        )));
        let (pruner, expiries) = TypingEventPruner::new(cid.clone(), settings.typing_timeout());
        let events = Arc::new(Mutex::new(
            ChannelEventHandler::new(cid.clone(), current_user_id, pruner).with_clock(clock),
        ));
        let unread = UnreadCountBuffer::spawn(cid.clone(), state.clone());
        let typing_expiry = tokio::spawn(run_typing_expiry(
            Arc::downgrade(&events),
            Arc::downgrade(&state),
            expiries,
        ));
        info!(cid = %cid, "channel: created");
        Self {
            cid,
            state,
            events,
            unread,
            api,
            classifier,
            watch_in_flight: AtomicBool::new(false),
            queries_in_flight: AtomicUsize::new(0),
            typing_expiry,
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Shared handle to the channel state for read access. Mutate through
    /// this type only.
    pub fn state(&self) -> Arc<Mutex<ChannelState>> {
        self.state.clone()
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.state.lock().await.subscribe()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages().to_vec()
    }

    pub async fn pagination(&self) -> PaginationFlags {
        self.state.lock().await.pagination()
    }

    pub async fn unread_count(&self) -> u32 {
        self.state
            .lock()
            .await
            .current_user_read()
            .map_or(0, |read| read.unread_messages)
    }

    /// Loads the latest page and starts watching. Only one watch may run at
    /// a time.
    pub async fn watch(&self, limit: u32) -> Result<(), ChannelError> {
        if self
            .watch_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(cid = %self.cid, "channel: watch already in progress");
            return Err(ChannelError::QueryInProgress(self.cid.clone()));
        }
        let _watching = FlagGuard(&self.watch_in_flight);
        let request = QueryChannelRequest {
            presence: true,
            ..QueryChannelRequest::latest(limit)
        };
        self.run_query(request).await
    }

    /// Loads a page before `base`, or before the oldest visible message.
    pub async fn load_older_messages(
        &self,
        limit: u32,
        base: Option<MessageId>,
    ) -> Result<(), ChannelError> {
        let base = match base {
            Some(base) => Some(base),
            None => self.state.lock().await.messages().first().map(|m| m.id.clone()),
        };
        self.run_query(QueryChannelRequest::older(limit, base)).await
    }

    /// Loads a page after `base`, or after the newest visible message.
    pub async fn load_newer_messages(
        &self,
        base: Option<MessageId>,
        limit: u32,
    ) -> Result<(), ChannelError> {
        let base = match base {
            Some(base) => Some(base),
            None => self.state.lock().await.messages().last().map(|m| m.id.clone()),
        };
        self.run_query(QueryChannelRequest::newer(limit, base)).await
    }

    pub async fn load_messages_around_id(
        &self,
        message_id: MessageId,
        limit: u32,
    ) -> Result<(), ChannelError> {
        self.run_query(QueryChannelRequest::around_id(limit, message_id))
            .await
    }

    /// Runs an arbitrary request through the same merge path as the
    /// pagination helpers.
    pub async fn query(&self, request: QueryChannelRequest) -> Result<(), ChannelError> {
        self.run_query(request).await
    }

    async fn run_query(&self, request: QueryChannelRequest) -> Result<(), ChannelError> {
        let direction = request.direction();
        {
            let mut state = self.state.lock().await;
            let flags = state.pagination();
            let busy = match direction {
                QueryDirection::Older => flags.loading_older,
                QueryDirection::Newer => flags.loading_newer,
                QueryDirection::Latest | QueryDirection::AroundId => false,
            };
            if busy {
                debug!(cid = %self.cid, ?direction, "channel: page already loading");
                return Ok(());
            }
            query::begin_query(&mut state, &request);
        }

        let _paused = self.pause_unread();
        let result = self.api.query_channel(&self.cid, &request).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(snapshot) => {
                query::apply_query_result(&mut state, &request, snapshot);
                Ok(())
            }
            Err(error) => {
                query::apply_query_error(&mut state, &request, &error, self.classifier.as_ref());
                Err(ChannelError::Query(error))
            }
        }
    }

    fn pause_unread(&self) -> UnreadPause<'_> {
        if self.queries_in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            self.unread.pause();
        }
        UnreadPause(self)
    }

    /// Applies one push event. Events for other channels are rejected.
    pub async fn handle_event(&self, event: &ChatEvent) -> Result<(), ChannelError> {
        if let Some(event_cid) = event.cid() {
            if event_cid != &self.cid {
                return Err(ChannelError::CidMismatch {
                    channel: self.cid.clone(),
                    event: event_cid.clone(),
                });
            }
        }
        let mut events = self.events.lock().await;
        let mut state = self.state.lock().await;
        if let Some(message) = events.handle(&mut state, event) {
            self.unread.increment_unread_count_if_necessary(message);
        }
        Ok(())
    }

    /// Merges a snapshot restored from local storage.
    pub async fn apply_local_snapshot(&self, snapshot: ChannelSnapshot) -> Result<(), ChannelError> {
        if snapshot.cid != self.cid {
            return Err(ChannelError::CidMismatch {
                channel: self.cid.clone(),
                event: snapshot.cid,
            });
        }
        let mut state = self.state.lock().await;
        query::apply_local_snapshot(&mut state, snapshot);
        Ok(())
    }

    pub async fn sync_mute_state(&self, mutes: &[ChannelMute]) {
        let events = self.events.lock().await;
        let mut state = self.state.lock().await;
        events.sync_mute_state(&mut state, mutes);
    }

    /// Returns `true` when a read request should be sent to the server.
    pub async fn mark_read(&self) -> bool {
        self.state.lock().await.mark_read()
    }

    /// Waits until every unread candidate queued so far was counted.
    pub async fn flush_unread(&self) {
        self.unread.flush().await;
    }
}

impl Drop for ChannelLogic {
    fn drop(&mut self) {
        self.typing_expiry.abort();
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct UnreadPause<'a>(&'a ChannelLogic);

impl Drop for UnreadPause<'_> {
    fn drop(&mut self) {
        if self.0.queries_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.unread.resume();
        }
    }
}

async fn run_typing_expiry(
    events: Weak<Mutex<ChannelEventHandler>>,
    state: Weak<Mutex<ChannelState>>,
    mut expiries: mpsc::UnboundedReceiver<TypingExpiry>,
) {
    while let Some(expiry) = expiries.recv().await {
        let (Some(handler), Some(channel)) = (events.upgrade(), state.upgrade()) else {
            return;
        };
        let mut handler = handler.lock().await;
        if let Some(snapshot) = handler.typing_mut().expire(&expiry) {
            channel.lock().await.set_typing(snapshot);
        }
    }
}

#[cfg(test)]
#[path = "tests/logic_tests.rs"]
mod tests;
