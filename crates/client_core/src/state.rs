use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{
    ChannelConfig, ChannelData, ChannelUserRead, Cid, Member, Message, MessageId, Poll, PollId,
    SyncStatus, User, UserId,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{config::StateSettings, typing::TypingSnapshot};

/// Which part of the channel changed. Published after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStateChange {
    Messages,
    CachedMessages,
    PinnedMessages,
    Members,
    Watchers,
    Reads,
    Typing,
    ChannelData,
    Polls,
    Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationFlags {
    pub loading_older: bool,
    pub loading_newer: bool,
    pub end_of_older: bool,
    pub end_of_newer: bool,
    pub inside_search: bool,
    pub recovery_needed: bool,
}

impl Default for PaginationFlags {
    fn default() -> Self {
        Self {
            loading_older: false,
            loading_newer: false,
            end_of_older: false,
            end_of_newer: true,
            inside_search: false,
            recovery_needed: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowLimits {
    message_limit: Option<usize>,
    trim_buffer: usize,
    cached_latest_limit: usize,
}

/// Which lists a removal touched.
#[derive(Debug, Clone, Copy, Default)]
struct Removed {
    messages: bool,
    cached: bool,
    pinned: bool,
}

#[derive(Debug, Clone, Copy)]
enum TrimDirection {
    FromOldest,
    FromNewest,
}

/// In-memory state of one channel. Every write goes through the methods
/// below; callers serialize access by holding the owning mutex.
pub struct ChannelState {
    cid: Cid,
    current_user_id: UserId,
    limits: WindowLimits,
    data: ChannelData,
    config: ChannelConfig,
    hidden: bool,
    hidden_messages_before: Option<DateTime<Utc>>,
    muted: bool,
    messages: Vec<Message>,
    cached_latest: Vec<Message>,
    pinned: Vec<Message>,
    quoted_by: HashMap<MessageId, HashSet<MessageId>>,
    members: HashMap<UserId, Member>,
    member_count: u32,
    watchers: HashMap<UserId, User>,
    watcher_count: u32,
    reads: HashMap<UserId, ChannelUserRead>,
    typing: TypingSnapshot,
    polls: HashMap<PollId, Poll>,
    messages_with_polls: HashMap<PollId, HashSet<MessageId>>,
    pagination: PaginationFlags,
    changes: broadcast::Sender<ChannelStateChange>,
}

impl ChannelState {
    pub fn new(cid: Cid, current_user_id: UserId, settings: &StateSettings) -> Self {
        let (changes, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            cid,
            current_user_id,
            limits: WindowLimits {
                message_limit: settings.message_limit,
                trim_buffer: settings.trim_buffer,
                cached_latest_limit: settings.cached_latest_limit,
            },
            data: ChannelData::default(),
            config: ChannelConfig::default(),
            hidden: false,
            hidden_messages_before: None,
            muted: false,
            messages: Vec::new(),
            cached_latest: Vec::new(),
            pinned: Vec::new(),
            quoted_by: HashMap::new(),
            members: HashMap::new(),
            member_count: 0,
            watchers: HashMap::new(),
            watcher_count: 0,
            reads: HashMap::new(),
            typing: TypingSnapshot::default(),
            polls: HashMap::new(),
            messages_with_polls: HashMap::new(),
            pagination: PaginationFlags::default(),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: ChannelStateChange) {
        let _ = self.changes.send(change);
    }

    // Read access.

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn current_user_id(&self) -> &UserId {
        &self.current_user_id
    }

    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn hidden_messages_before(&self) -> Option<DateTime<Utc>> {
        self.hidden_messages_before
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn cached_latest_messages(&self) -> &[Message] {
        &self.cached_latest
    }

    pub fn pinned_messages(&self) -> &[Message] {
        &self.pinned
    }

    pub fn get_message_by_id(&self, id: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .chain(self.cached_latest.iter())
            .chain(self.pinned.iter())
            .find(|message| &message.id == id)
    }

    pub fn replies_to(&self, quoted_id: &MessageId) -> Option<&HashSet<MessageId>> {
        self.quoted_by.get(quoted_id)
    }

    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.get(user_id)
    }

    /// Members ordered by join time.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_by(|a, b| {
            (a.created_at, a.user_id()).cmp(&(b.created_at, b.user_id()))
        });
        members
    }

    pub fn member_count(&self) -> u32 {
        self.member_count
    }

    pub fn membership(&self) -> Option<&Member> {
        self.data.membership.as_ref()
    }

    pub fn watchers(&self) -> Vec<User> {
        let mut watchers: Vec<User> = self.watchers.values().cloned().collect();
        watchers.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        watchers
    }

    pub fn watcher_count(&self) -> u32 {
        self.watcher_count
    }

    pub fn read(&self, user_id: &UserId) -> Option<&ChannelUserRead> {
        self.reads.get(user_id)
    }

    pub fn reads(&self) -> &HashMap<UserId, ChannelUserRead> {
        &self.reads
    }

    pub fn current_user_read(&self) -> Option<&ChannelUserRead> {
        self.reads.get(&self.current_user_id)
    }

    pub fn typing(&self) -> &TypingSnapshot {
        &self.typing
    }

    pub fn poll(&self, id: &PollId) -> Option<&Poll> {
        self.polls.get(id)
    }

    pub fn pagination(&self) -> PaginationFlags {
        self.pagination
    }

    pub fn is_inside_search(&self) -> bool {
        self.pagination.inside_search
    }

    // Messages.

    /// Returns `false` when the message was filtered out or lost to a newer
    /// stored copy.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        let accepted = self.accepts(&message);
        self.upsert_messages(vec![message], false);
        accepted
    }

    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.upsert_messages(messages, true);
    }

    /// Merges `messages` into the visible window. With `replace` the window
    /// is cleared first; otherwise an incoming message only replaces a stored
    /// one that is not newer than it.
    pub fn upsert_messages(&mut self, messages: Vec<Message>, replace: bool) {
        let mut changed = replace && !self.messages.is_empty();
        let replaced: Vec<MessageId> = if replace {
            self.messages.drain(..).map(|message| message.id).collect()
        } else {
            Vec::new()
        };
        for message in messages {
            if self.should_ignore_upsertion(&message) {
                continue;
            }
            if !replace && !is_newer_than_current(self.get_message_by_id(&message.id), &message)
            {
                debug!(cid = %self.cid, message_id = %message.id, "channel: skipping stale message");
                continue;
            }
            let message = self.link_message(message);
            let quoted = message.clone();
            insert_sorted(&mut self.messages, message, None);
            self.refresh_quoting_messages(&quoted);
            changed = true;
        }
        self.prune_links(replaced);
        if changed {
            self.notify(ChannelStateChange::Messages);
        }
    }

    /// Stores a message that arrived while a historical window is shown.
    pub fn upsert_cached_message(&mut self, message: Message) -> bool {
        if !self.accepts(&message) {
            return false;
        }
        let message = self.link_message(message);
        let quoted = message.clone();
        let dropped = insert_sorted(
            &mut self.cached_latest,
            message,
            Some(self.limits.cached_latest_limit),
        );
        self.refresh_quoting_messages(&quoted);
        self.prune_links(dropped);
        self.notify(ChannelStateChange::CachedMessages);
        true
    }

    /// Replaces a stored message wherever it is kept. Returns `false` when
    /// the message is unknown.
    pub fn update_message(&mut self, message: Message) -> bool {
        if self.get_message_by_id(&message.id).is_none() {
            return false;
        }
        let message = self.link_message(message);
        let mut found = false;
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            if let Some(slot) = list.iter_mut().find(|stored| stored.id == message.id) {
                *slot = message.clone();
                found = true;
            }
        }
        if found {
            self.refresh_quoting_messages(&message);
            self.notify(ChannelStateChange::Messages);
        }
        found
    }

    /// Hard delete.
    pub fn delete_message(&mut self, id: &MessageId) {
        let ids = HashSet::from([id.clone()]);
        let removed = self.remove_messages(&ids);
        self.delete_quoted_references(id);
        self.notify_removed(removed);
    }

    /// Drops messages created at or before `date`, then stores the optional
    /// system message that announced the truncation.
    pub fn remove_messages_before(&mut self, date: DateTime<Utc>, system_message: Option<Message>) {
        let created_after = |message: &Message| {
            message
                .created_at_or_local()
                .is_some_and(|created| created > date)
        };
        let dropped: Vec<MessageId> = self
            .messages
            .iter()
            .chain(self.cached_latest.iter())
            .chain(self.pinned.iter())
            .filter(|&message| !created_after(message))
            .map(|message| message.id.clone())
            .collect();
        let cached_before = self.cached_latest.len();
        self.messages.retain(created_after);
        self.cached_latest.retain(created_after);
        self.pinned.retain(created_after);
        self.prune_links(dropped);
        self.hidden_messages_before = Some(date);
        debug!(cid = %self.cid, before = %date, "channel: removed messages");
        self.notify(ChannelStateChange::Messages);
        self.notify(ChannelStateChange::PinnedMessages);
        if cached_before != self.cached_latest.len() {
            self.notify(ChannelStateChange::CachedMessages);
        }
        if let Some(message) = system_message {
            self.upsert_message(message);
        }
    }

    pub fn delete_messages_from_user(
        &mut self,
        user_id: &UserId,
        hard: bool,
        deleted_at: DateTime<Utc>,
    ) {
        let from_user: Vec<Message> = self
            .messages
            .iter()
            .chain(self.cached_latest.iter())
            .chain(self.pinned.iter())
            .filter(|message| &message.user.id == user_id)
            .cloned()
            .collect();
        if from_user.is_empty() {
            return;
        }
        if hard {
            let ids: HashSet<MessageId> = from_user.into_iter().map(|message| message.id).collect();
            let removed = self.remove_messages(&ids);
            for id in &ids {
                self.delete_quoted_references(id);
            }
            self.notify_removed(removed);
        } else {
            for message in from_user {
                self.update_message(Message {
                    deleted_at: Some(deleted_at),
                    ..message
                });
            }
        }
    }

    fn accepts(&self, message: &Message) -> bool {
        !self.should_ignore_upsertion(message)
            && is_newer_than_current(self.get_message_by_id(&message.id), message)
    }

    fn should_ignore_upsertion(&self, message: &Message) -> bool {
        let shadowed_from_other = message.shadowed && message.user.id != self.current_user_id;
        shadowed_from_other || message.is_thread_reply_hidden()
    }

    /// Records poll and quote links for `message` and resolves its quoted
    /// message against what is already stored. A message that now quotes
    /// something else leaves the reply set of its previous quote.
    fn link_message(&mut self, mut message: Message) -> Message {
        if let Some(poll) = &message.poll {
            self.register_poll(poll, &message.id);
        }
        let previous_quote = self
            .get_message_by_id(&message.id)
            .and_then(|stored| stored.quoted_message_id().cloned())
            .filter(|previous| message.quoted_message_id() != Some(previous));
        if let Some(previous) = previous_quote {
            self.unlink_reply(&previous, &message.id);
        }
        if let Some(quoted_id) = message.quoted_message_id().cloned() {
            self.quoted_by
                .entry(quoted_id.clone())
                .or_default()
                .insert(message.id.clone());
            if let Some(known) = self.get_message_by_id(&quoted_id) {
                let stale = message
                    .reply_to
                    .as_ref()
                    .map_or(true, |embedded| known.last_update_time() >= embedded.last_update_time());
                if stale {
                    message.reply_to = Some(Box::new(known.clone()));
                }
            }
        }
        message
    }

    fn refresh_quoting_messages(&mut self, quoted: &Message) {
        let Some(reply_ids) = self.quoted_by.get(&quoted.id) else {
            return;
        };
        if reply_ids.is_empty() {
            return;
        }
        let reply_ids = reply_ids.clone();
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            let replies = list
                .iter_mut()
                .filter(|m| reply_ids.contains(&m.id) && m.quoted_message_id() == Some(&quoted.id));
            for message in replies {
                message.reply_to = Some(Box::new(quoted.clone()));
            }
        }
    }

    fn unlink_reply(&mut self, quoted_id: &MessageId, reply_id: &MessageId) {
        if let Some(replies) = self.quoted_by.get_mut(quoted_id) {
            replies.remove(reply_id);
            if replies.is_empty() {
                self.quoted_by.remove(quoted_id);
            }
        }
    }

    fn delete_quoted_references(&mut self, quoted_id: &MessageId) {
        let Some(reply_ids) = self.quoted_by.remove(quoted_id) else {
            return;
        };
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            for message in list.iter_mut().filter(|m| reply_ids.contains(&m.id)) {
                message.reply_to = None;
            }
        }
    }

    fn remove_messages(&mut self, ids: &HashSet<MessageId>) -> Removed {
        let retain = |list: &mut Vec<Message>| {
            let before = list.len();
            list.retain(|message| !ids.contains(&message.id));
            before != list.len()
        };
        let removed = Removed {
            messages: retain(&mut self.messages),
            cached: retain(&mut self.cached_latest),
            pinned: retain(&mut self.pinned),
        };
        self.prune_links(ids.iter().cloned().collect());
        removed
    }

    fn notify_removed(&self, removed: Removed) {
        if removed.messages {
            self.notify(ChannelStateChange::Messages);
        }
        if removed.cached {
            self.notify(ChannelStateChange::CachedMessages);
        }
        if removed.pinned {
            self.notify(ChannelStateChange::PinnedMessages);
        }
    }

    /// Drops quote and poll links held by messages that are no longer
    /// stored in any list. A poll nobody carries any more is forgotten.
    fn prune_links(&mut self, candidates: Vec<MessageId>) {
        let gone: HashSet<MessageId> = candidates
            .into_iter()
            .filter(|id| self.get_message_by_id(id).is_none())
            .collect();
        if gone.is_empty() {
            return;
        }
        self.quoted_by.retain(|_, replies| {
            replies.retain(|id| !gone.contains(id));
            !replies.is_empty()
        });
        let polls = &mut self.polls;
        self.messages_with_polls.retain(|poll_id, carriers| {
            carriers.retain(|id| !gone.contains(id));
            if carriers.is_empty() {
                polls.remove(poll_id);
            }
            !carriers.is_empty()
        });
    }

    // Pinned messages.

    pub fn add_pinned_message(&mut self, message: Message) {
        self.add_pinned_messages(vec![message]);
    }

    pub fn add_pinned_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            let message = self.link_message(message);
            self.pinned.retain(|stored| stored.id != message.id);
            let pinned_at = message.pinned_at;
            let index = self
                .pinned
                .partition_point(|stored| (stored.pinned_at, &stored.id) < (pinned_at, &message.id));
            self.pinned.insert(index, message);
        }
        self.notify(ChannelStateChange::PinnedMessages);
    }

    pub fn set_pinned_messages(&mut self, messages: Vec<Message>) {
        let previous: Vec<MessageId> = self.pinned.drain(..).map(|message| message.id).collect();
        self.add_pinned_messages(messages);
        self.prune_links(previous);
    }

    pub fn delete_pinned_message(&mut self, id: &MessageId) {
        let before = self.pinned.len();
        self.pinned.retain(|message| &message.id != id);
        if before != self.pinned.len() {
            self.prune_links(vec![id.clone()]);
            self.notify(ChannelStateChange::PinnedMessages);
        }
    }

    // Members and watchers.

    pub fn add_member(&mut self, member: Member) {
        if !self.members.contains_key(member.user_id()) {
            self.member_count += 1;
        }
        self.members.insert(member.user_id().clone(), member);
        self.notify(ChannelStateChange::Members);
    }

    pub fn upsert_member(&mut self, member: Member) {
        self.upsert_members(vec![member]);
    }

    pub fn upsert_members(&mut self, members: Vec<Member>) {
        for member in members {
            self.members.insert(member.user_id().clone(), member);
        }
        self.notify(ChannelStateChange::Members);
    }

    pub fn delete_member(&mut self, user_id: &UserId) {
        if self.members.remove(user_id).is_some() {
            self.member_count = self.member_count.saturating_sub(1);
            self.notify(ChannelStateChange::Members);
        }
    }

    pub fn set_members(&mut self, members: Vec<Member>, member_count: u32) {
        self.members = members
            .into_iter()
            .map(|member| (member.user_id().clone(), member))
            .collect();
        self.member_count = member_count;
        self.notify(ChannelStateChange::Members);
    }

    pub fn set_member_count(&mut self, member_count: u32) {
        self.member_count = member_count;
        self.notify(ChannelStateChange::Members);
    }

    pub fn set_membership(&mut self, membership: Option<Member>) {
        self.data.membership = membership;
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn update_member_ban(
        &mut self,
        user_id: &UserId,
        banned: bool,
        expires: Option<DateTime<Utc>>,
        shadow: bool,
    ) {
        let Some(member) = self.members.get_mut(user_id) else {
            return;
        };
        member.banned = banned;
        member.ban_expires = expires;
        member.shadow_banned = shadow;
        self.notify(ChannelStateChange::Members);
    }

    pub fn upsert_watcher(&mut self, user: User, watcher_count: u32) {
        self.watchers.insert(user.id.clone(), user);
        self.watcher_count = watcher_count;
        self.notify(ChannelStateChange::Watchers);
    }

    pub fn delete_watcher(&mut self, user_id: &UserId, watcher_count: u32) {
        self.watchers.remove(user_id);
        self.watcher_count = watcher_count;
        self.notify(ChannelStateChange::Watchers);
    }

    pub fn set_watchers(&mut self, watchers: Vec<User>, watcher_count: u32) {
        self.watchers = watchers
            .into_iter()
            .map(|user| (user.id.clone(), user))
            .collect();
        self.watcher_count = watcher_count;
        self.notify(ChannelStateChange::Watchers);
    }

    /// Presence changes touch every place the user is embedded, without
    /// altering membership or message content.
    pub fn upsert_user_presence(&mut self, user: &User) {
        if let Some(member) = self.members.get_mut(&user.id) {
            member.user = user.clone();
        }
        if let Some(watcher) = self.watchers.get_mut(&user.id) {
            *watcher = user.clone();
        }
        if let Some(created_by) = self.data.created_by.as_mut() {
            if created_by.id == user.id {
                *created_by = user.clone();
            }
        }
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            for message in list.iter_mut().filter(|m| m.user.id == user.id) {
                message.user = user.clone();
            }
        }
        self.notify(ChannelStateChange::Members);
        self.notify(ChannelStateChange::Watchers);
        self.notify(ChannelStateChange::Messages);
    }

    // Reads.

    pub fn update_read(&mut self, read: ChannelUserRead) {
        self.update_reads(vec![read]);
    }

    /// Overwrites per-user reads. The current user's entry keeps its local
    /// unread count and watermark when the incoming one is older.
    pub fn update_reads(&mut self, reads: Vec<ChannelUserRead>) {
        for read in reads {
            let read = match self.reads.get(read.user_id()) {
                Some(local) if read.user_id() == &self.current_user_id => {
                    merge_current_user_read(local, read)
                }
                _ => read,
            };
            self.reads.insert(read.user_id().clone(), read);
        }
        self.notify(ChannelStateChange::Reads);
    }

    /// Delivery receipts only move the delivered fields of an existing read.
    pub fn update_delivered(&mut self, read: ChannelUserRead) {
        let updated = match self.reads.get(read.user_id()) {
            Some(existing) => ChannelUserRead {
                user: read.user,
                last_delivered_at: read.last_delivered_at,
                last_delivered_message_id: read.last_delivered_message_id,
                ..existing.clone()
            },
            None => read,
        };
        self.reads.insert(updated.user_id().clone(), updated);
        self.notify(ChannelStateChange::Reads);
    }

    /// Counts one more unread message for the current user and moves the
    /// watermark to `received_at`.
    pub fn increment_current_user_unread(&mut self, received_at: DateTime<Utc>) -> u32 {
        let current_user_id = self.current_user_id.clone();
        let read = self
            .reads
            .entry(current_user_id.clone())
            .or_insert_with(|| ChannelUserRead {
                user: User {
                    id: current_user_id,
                    ..User::default()
                },
                ..ChannelUserRead::default()
            });
        read.unread_messages += 1;
        read.last_received_event_date = Some(received_at);
        let unread = read.unread_messages;
        self.notify(ChannelStateChange::Reads);
        unread
    }

    /// Marks everything visible as read for the current user. Returns `true`
    /// when a read request is worth sending.
    pub fn mark_read(&mut self) -> bool {
        if !self.config.read_events_enabled {
            return false;
        }
        let Some(last) = self.messages.last() else {
            return true;
        };
        let (last_id, last_at) = (last.id.clone(), last.created_at_or_local());
        let Some(read) = self.reads.get_mut(&self.current_user_id) else {
            return true;
        };
        if read.last_read_message_id.as_ref() == Some(&last_id) {
            return false;
        }
        let at = last_at.unwrap_or_else(Utc::now);
        read.last_read = Some(at);
        read.last_received_event_date = Some(at);
        read.last_read_message_id = Some(last_id);
        read.unread_messages = 0;
        self.notify(ChannelStateChange::Reads);
        true
    }

    // Typing.

    pub fn set_typing(&mut self, snapshot: TypingSnapshot) {
        self.typing = snapshot;
        self.notify(ChannelStateChange::Typing);
    }

    // Channel data.

    pub fn set_channel_data(&mut self, data: ChannelData) {
        self.data = data;
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn update_channel_data(&mut self, incoming: ChannelData) {
        self.data = self.data.merge_from_event(incoming);
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn set_config(&mut self, config: ChannelConfig) {
        self.config = config;
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        if self.hidden != hidden {
            self.hidden = hidden;
            self.notify(ChannelStateChange::ChannelData);
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            self.muted = muted;
            self.notify(ChannelStateChange::ChannelData);
        }
    }

    pub fn set_message_count(&mut self, count: u32) {
        self.data.message_count = Some(count);
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn update_last_message_at(&mut self, message: &Message) {
        if message.is_system() && self.config.skip_last_msg_update_for_system_msgs {
            return;
        }
        let Some(created) = message.created_at_or_local() else {
            return;
        };
        if self.data.last_message_at.map_or(true, |current| created > current) {
            self.data.last_message_at = Some(created);
            self.notify(ChannelStateChange::ChannelData);
        }
    }

    pub fn set_hidden_messages_before(&mut self, date: Option<DateTime<Utc>>) {
        self.hidden_messages_before = date;
        self.notify(ChannelStateChange::ChannelData);
    }

    pub fn delete_channel(&mut self, deleted_at: DateTime<Utc>) {
        self.data.deleted_at = Some(deleted_at);
        self.notify(ChannelStateChange::ChannelData);
    }

    // Polls.

    fn register_poll(&mut self, poll: &Poll, message_id: &MessageId) {
        self.polls.insert(poll.id.clone(), poll.clone());
        self.messages_with_polls
            .entry(poll.id.clone())
            .or_default()
            .insert(message_id.clone());
    }

    /// Stores `poll` and refreshes every message that carries it.
    pub fn upsert_poll(&mut self, poll: Poll) {
        let linked = self
            .messages_with_polls
            .get(&poll.id)
            .cloned()
            .unwrap_or_default();
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            for message in list.iter_mut().filter(|m| linked.contains(&m.id)) {
                message.poll = Some(poll.clone());
            }
        }
        self.polls.insert(poll.id.clone(), poll);
        self.notify(ChannelStateChange::Polls);
        if !linked.is_empty() {
            self.notify(ChannelStateChange::Messages);
        }
    }

    pub fn delete_poll(&mut self, poll_id: &PollId) {
        self.polls.remove(poll_id);
        let linked = self.messages_with_polls.remove(poll_id).unwrap_or_default();
        for list in [&mut self.messages, &mut self.cached_latest, &mut self.pinned] {
            for message in list.iter_mut().filter(|m| linked.contains(&m.id)) {
                message.poll = None;
            }
        }
        self.notify(ChannelStateChange::Polls);
    }

    // Pagination.

    pub fn set_loading_older(&mut self, loading: bool) {
        self.pagination.loading_older = loading;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn set_loading_newer(&mut self, loading: bool) {
        self.pagination.loading_newer = loading;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn set_end_of_older(&mut self, end: bool) {
        self.pagination.end_of_older = end;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn set_end_of_newer(&mut self, end: bool) {
        self.pagination.end_of_newer = end;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn set_inside_search(&mut self, inside_search: bool) {
        self.pagination.inside_search = inside_search;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn set_recovery_needed(&mut self, recovery_needed: bool) {
        self.pagination.recovery_needed = recovery_needed;
        self.notify(ChannelStateChange::Pagination);
    }

    pub fn cache_latest_messages(&mut self) {
        let previous = std::mem::replace(&mut self.cached_latest, self.messages.clone());
        self.prune_links(previous.into_iter().map(|message| message.id).collect());
        self.notify(ChannelStateChange::CachedMessages);
    }

    pub fn clear_cached_latest_messages(&mut self) {
        let previous: Vec<MessageId> = self.cached_latest.drain(..).map(|message| message.id).collect();
        self.prune_links(previous);
        self.notify(ChannelStateChange::CachedMessages);
    }

    /// Call after loading newer messages.
    pub fn trim_oldest_messages(&mut self) {
        self.apply_message_limit(TrimDirection::FromOldest);
    }

    /// Call after loading older messages. The live tail is cached before it
    /// is cut off.
    pub fn trim_newest_messages(&mut self) {
        self.apply_message_limit(TrimDirection::FromNewest);
    }

    fn apply_message_limit(&mut self, direction: TrimDirection) {
        let Some(limit) = self.limits.message_limit else {
            return;
        };
        let size = self.messages.len();
        if size <= limit + self.limits.trim_buffer {
            return;
        }
        debug!(cid = %self.cid, size, limit, ?direction, "channel: trimming message window");
        match direction {
            TrimDirection::FromOldest => {
                let dropped = self.messages.drain(..size - limit).map(|message| message.id).collect();
                self.prune_links(dropped);
                self.pagination.end_of_older = false;
            }
            TrimDirection::FromNewest => {
                if !self.pagination.inside_search {
                    self.cache_latest_messages();
                }
                let dropped = self.messages.drain(limit..).map(|message| message.id).collect();
                self.prune_links(dropped);
                self.pagination.end_of_newer = false;
                self.pagination.inside_search = true;
            }
        }
        self.notify(ChannelStateChange::Messages);
        self.notify(ChannelStateChange::Pagination);
    }
}

/// Stored message loses to `incoming` unless it is strictly newer. Completed
/// messages compare server timestamps, pending ones their local timestamps.
fn is_newer_than_current(current: Option<&Message>, incoming: &Message) -> bool {
    let Some(current) = current else {
        return true;
    };
    if incoming.sync_status == SyncStatus::Completed {
        current.last_update_time() <= incoming.last_update_time()
    } else {
        current.last_local_update_time() <= incoming.last_local_update_time()
    }
}

/// Returns the ids of the oldest messages dropped to honor `max_len`.
fn insert_sorted(list: &mut Vec<Message>, message: Message, max_len: Option<usize>) -> Vec<MessageId> {
    if let Some(position) = list.iter().position(|stored| stored.id == message.id) {
        list.remove(position);
    }
    let created = message.created_at_or_local();
    let index =
        list.partition_point(|stored| (stored.created_at_or_local(), &stored.id) < (created, &message.id));
    list.insert(index, message);
    match max_len {
        Some(max_len) if list.len() > max_len => {
            let excess = list.len() - max_len;
            list.drain(..excess).map(|message| message.id).collect()
        }
        _ => Vec::new(),
    }
}

fn merge_current_user_read(local: &ChannelUserRead, server: ChannelUserRead) -> ChannelUserRead {
    if local.last_received_event_date > server.last_received_event_date {
        ChannelUserRead {
            user: server.user,
            last_read: local.last_read.max(server.last_read),
            last_read_message_id: server
                .last_read_message_id
                .or_else(|| local.last_read_message_id.clone()),
            last_delivered_at: server.last_delivered_at.or(local.last_delivered_at),
            last_delivered_message_id: server
                .last_delivered_message_id
                .or_else(|| local.last_delivered_message_id.clone()),
            ..local.clone()
        }
    } else {
        server
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
