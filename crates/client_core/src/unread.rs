use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::domain::{Cid, Message, MessageId};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::state::ChannelState;

enum UnreadCommand {
    Count(Message),
    Flush(oneshot::Sender<()>),
}

/// Serializes unread-count increments for one channel. A single worker task
/// drains the queue in order; while paused the queue only grows.
pub struct UnreadCountBuffer {
    cid: Cid,
    queue: mpsc::UnboundedSender<UnreadCommand>,
    paused: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl UnreadCountBuffer {
    pub fn spawn(cid: Cid, state: Arc<Mutex<ChannelState>>) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (paused, gate) = watch::channel(false);
        let worker = tokio::spawn(run_worker(cid.clone(), state, receiver, gate));
        Self {
            cid,
            queue,
            paused,
            worker,
        }
    }

    pub fn increment_unread_count_if_necessary(&self, message: Message) {
        let _ = self.queue.send(UnreadCommand::Count(message));
    }

    /// Defers processing until [`resume`](Self::resume). Queued messages are
    /// kept.
    pub fn pause(&self) {
        debug!(cid = %self.cid, "unread: paused");
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        debug!(cid = %self.cid, "unread: resumed");
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves once every message queued before this call was processed.
    /// Waits for a resume first when the buffer is paused.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(UnreadCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Drop for UnreadCountBuffer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    cid: Cid,
    state: Arc<Mutex<ChannelState>>,
    mut receiver: mpsc::UnboundedReceiver<UnreadCommand>,
    mut gate: watch::Receiver<bool>,
) {
    let mut tracker = UnreadTracker::new(PROCESSED_CAPACITY);
    while let Some(command) = receiver.recv().await {
        if gate.wait_for(|paused| !paused).await.is_err() {
            return;
        }
        match command {
            UnreadCommand::Count(message) => {
                let mut state = state.lock().await;
                tracker.count_if_necessary(&cid, &mut state, &message);
            }
            UnreadCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

const PROCESSED_CAPACITY: usize = 100;

/// Worker-owned dedup memory: the most recent message ids already examined
/// and the time of the last message this worker counted.
struct UnreadTracker {
    capacity: usize,
    processed: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    last_counted_at: Option<DateTime<Utc>>,
}

impl UnreadTracker {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            processed: HashSet::new(),
            order: VecDeque::new(),
            last_counted_at: None,
        }
    }

    /// Counts `message` as unread for the current user when it is someone
    /// else's visible message, not seen before and not older than the read
    /// watermark, and the channel is not muted.
    ///
    /// A message stamped exactly at the watermark still counts when the
    /// watermark was left by this worker's previous increment; a watermark
    /// set by the server already covers it.
    fn count_if_necessary(&mut self, cid: &Cid, state: &mut ChannelState, message: &Message) -> bool {
        let Some(received_at) = message.created_at_or_local() else {
            return false;
        };
        if !self.remember(&message.id) {
            trace!(cid = %cid, message_id = %message.id, "unread: duplicate message");
            return false;
        }
        if &message.user.id == state.current_user_id()
            || state.is_muted()
            || message.shadowed
            || message.silent
            || message.is_thread_reply_hidden()
        {
            trace!(cid = %cid, message_id = %message.id, "unread: not counted");
            return false;
        }
        let watermark = state
            .current_user_read()
            .and_then(|read| read.last_received_event_date);
        let seen = watermark.is_some_and(|seen| {
            received_at < seen || (received_at == seen && self.last_counted_at != Some(seen))
        });
        if seen {
            trace!(cid = %cid, message_id = %message.id, "unread: already seen");
            return false;
        }
        let unread = state.increment_current_user_unread(received_at);
        self.last_counted_at = Some(received_at);
        debug!(cid = %cid, message_id = %message.id, unread, "unread: incremented");
        true
    }

    /// Returns `false` when `id` was already recorded. The oldest id is
    /// forgotten once the capacity is reached.
    fn remember(&mut self, id: &MessageId) -> bool {
        if !self.processed.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
