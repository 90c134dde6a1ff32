use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use shared::domain::{Cid, MessageId, User, UserId};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

/// A user's most recent "started typing" fact.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingStart {
    pub user: User,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<MessageId>,
}

/// Who is typing right now: the raw per-user facts plus the users ordered
/// by when they started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypingSnapshot {
    pub events: HashMap<UserId, TypingStart>,
    pub users: Vec<User>,
}

impl TypingSnapshot {
    pub fn is_typing(&self, user_id: &UserId) -> bool {
        self.events.contains_key(user_id)
    }
}

/// Sent by a timer when a typing fact runs out. `generation` ties the expiry
/// to the start event that armed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingExpiry {
    pub user_id: UserId,
    pub generation: u64,
}

struct TypingEntry {
    event: TypingStart,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Tracks typing users and drops each one after `timeout` unless a newer
/// start event refreshes it. Timers run on the tokio runtime and report
/// through the receiver returned by [`TypingEventPruner::new`].
pub struct TypingEventPruner {
    cid: Cid,
    timeout: Duration,
    entries: HashMap<UserId, TypingEntry>,
    next_generation: u64,
    expiries: mpsc::UnboundedSender<TypingExpiry>,
}

impl TypingEventPruner {
    pub fn new(cid: Cid, timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TypingExpiry>) {
        let (expiries, receiver) = mpsc::unbounded_channel();
        (
            Self {
                cid,
                timeout,
                entries: HashMap::new(),
                next_generation: 0,
                expiries,
            },
            receiver,
        )
    }

    /// `None` removes the user immediately. A start event replaces any
    /// previous one and re-arms the timer. Must be called inside a tokio
    /// runtime when `event` is `Some`.
    pub fn process_event(&mut self, user_id: &UserId, event: Option<TypingStart>) -> TypingSnapshot {
        if let Some(previous) = self.entries.remove(user_id) {
            previous.timer.abort();
        }

        if let Some(event) = event {
            self.next_generation += 1;
            let generation = self.next_generation;
            let timer = self.arm_timer(user_id.clone(), generation);
            self.entries.insert(
                user_id.clone(),
                TypingEntry {
                    event,
                    generation,
                    timer,
                },
            );
            debug!(cid = %self.cid, user_id = %user_id, "typing: started");
        } else {
            debug!(cid = %self.cid, user_id = %user_id, "typing: stopped");
        }

        self.snapshot()
    }

    /// Applies a fired timer. Returns `None` for expiries that were
    /// superseded by a newer start event.
    pub fn expire(&mut self, expiry: &TypingExpiry) -> Option<TypingSnapshot> {
        let current = self.entries.get(&expiry.user_id)?;
        if current.generation != expiry.generation {
            return None;
        }
        self.entries.remove(&expiry.user_id);
        debug!(cid = %self.cid, user_id = %expiry.user_id, "typing: expired");
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> TypingSnapshot {
        let mut started: Vec<&TypingStart> = self.entries.values().map(|entry| &entry.event).collect();
        started.sort_by(|a, b| (a.created_at, &a.user.id).cmp(&(b.created_at, &b.user.id)));
        TypingSnapshot {
            events: self
                .entries
                .iter()
                .map(|(user_id, entry)| (user_id.clone(), entry.event.clone()))
                .collect(),
            users: started.into_iter().map(|event| event.user.clone()).collect(),
        }
    }

    /// Cancels every timer and forgets all typing users.
    pub fn clear(&mut self) -> TypingSnapshot {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
        TypingSnapshot::default()
    }

    fn arm_timer(&self, user_id: UserId, generation: u64) -> JoinHandle<()> {
        let expiries = self.expiries.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expiries.send(TypingExpiry {
                user_id,
                generation,
            });
        })
    }
}

impl Drop for TypingEventPruner {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
