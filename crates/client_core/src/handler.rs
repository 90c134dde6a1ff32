use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChannelMute, ChannelUserRead, Cid, Message, MessageId, MessageReminderInfo, Poll,
        Reaction, User, UserId, Vote,
    },
    protocol::{ChannelSnapshot, ChatEvent},
};
use tracing::{debug, trace};

use crate::{
    state::ChannelState,
    typing::{TypingEventPruner, TypingStart},
};

pub type Clock = fn() -> DateTime<Utc>;

/// Folds real-time events into one channel's state.
pub struct ChannelEventHandler {
    cid: Cid,
    current_user_id: UserId,
    typing: TypingEventPruner,
    clock: Clock,
}

impl ChannelEventHandler {
    pub fn new(cid: Cid, current_user_id: UserId, typing: TypingEventPruner) -> Self {
        Self {
            cid,
            current_user_id,
            typing,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn typing_mut(&mut self) -> &mut TypingEventPruner {
        &mut self.typing
    }

    /// Applies `event` to `state`. Returns the message the unread buffer
    /// should consider, if the event delivered one.
    pub fn handle(&mut self, state: &mut ChannelState, event: &ChatEvent) -> Option<Message> {
        trace!(cid = %self.cid, kind = event.kind(), "channel: handling event");
        match event {
            ChatEvent::NewMessage {
                message,
                channel_message_count,
                ..
            } => {
                if let Some(count) = channel_message_count {
                    state.set_message_count(*count);
                }
                return Some(self.insert_new_message(state, message.clone()));
            }
            ChatEvent::NotificationMessageNew { message, .. } => {
                return Some(self.insert_new_message(state, message.clone()));
            }
            ChatEvent::NotificationThreadMessageNew { message, .. } => {
                if message.show_in_channel {
                    if !message.shadowed {
                        state.set_hidden(false);
                    }
                    let message = self.enrich(state, message.clone());
                    self.store_message(state, message);
                }
            }
            ChatEvent::MessageUpdated { message, .. } => {
                let message = self.enrich(state, message.clone());
                self.store_message(state, message);
            }
            ChatEvent::MessageDeleted {
                message,
                hard_delete,
                channel_message_count,
                ..
            } => {
                if *hard_delete {
                    state.delete_message(&message.id);
                    state.delete_pinned_message(&message.id);
                } else {
                    let message = self.enrich(state, message.clone());
                    self.store_message(state, message);
                }
                if let Some(count) = channel_message_count {
                    state.set_message_count(*count);
                }
            }
            ChatEvent::ReactionNew {
                message, reaction, ..
            } => self.apply_reaction(state, message, reaction, ReactionChange::Added),
            ChatEvent::ReactionUpdated {
                message, reaction, ..
            } => self.apply_reaction(state, message, reaction, ReactionChange::Updated),
            ChatEvent::ReactionDeleted {
                message, reaction, ..
            } => self.apply_reaction(state, message, reaction, ReactionChange::Deleted),
            ChatEvent::MemberAdded { member, .. } => {
                state.add_member(member.clone());
                if member.user_id() == &self.current_user_id {
                    state.set_membership(Some(member.clone()));
                }
            }
            ChatEvent::MemberUpdated { member, .. } => {
                state.upsert_member(member.clone());
                if member.user_id() == &self.current_user_id {
                    state.set_membership(Some(member.clone()));
                }
            }
            ChatEvent::MemberRemoved { member, .. } => {
                state.delete_member(member.user_id());
                if member.user_id() == &self.current_user_id {
                    state.set_membership(None);
                }
            }
            ChatEvent::NotificationAddedToChannel { channel, .. }
            | ChatEvent::NotificationRemovedFromChannel { channel, .. } => {
                self.replace_members(state, channel);
            }
            ChatEvent::NotificationInviteAccepted {
                member, channel, ..
            } => {
                state.update_channel_data(channel.clone());
                state.add_member(member.clone());
                if member.user_id() == &self.current_user_id {
                    state.set_membership(Some(member.clone()));
                }
            }
            ChatEvent::NotificationInviteRejected {
                member, channel, ..
            } => {
                state.update_channel_data(channel.clone());
                state.delete_member(member.user_id());
            }
            ChatEvent::UserStartWatching {
                user,
                watcher_count,
                ..
            } => state.upsert_watcher(user.clone(), *watcher_count),
            ChatEvent::UserStopWatching {
                user,
                watcher_count,
                ..
            } => state.delete_watcher(&user.id, *watcher_count),
            ChatEvent::ChannelUpdated { channel, .. } => {
                state.update_channel_data(channel.clone());
            }
            ChatEvent::ChannelHidden {
                created_at,
                clear_history,
                ..
            } => {
                state.set_hidden(true);
                if *clear_history {
                    state.remove_messages_before(*created_at, None);
                }
            }
            ChatEvent::ChannelVisible { .. } => state.set_hidden(false),
            ChatEvent::ChannelDeleted { created_at, .. } => {
                state.remove_messages_before(*created_at, None);
                state.delete_channel(*created_at);
                let cleared = self.typing.clear();
                state.set_typing(cleared);
            }
            ChatEvent::ChannelTruncated {
                created_at,
                message,
                ..
            } => state.remove_messages_before(*created_at, message.clone()),
            ChatEvent::NotificationChannelTruncated { created_at, .. } => {
                state.remove_messages_before(*created_at, None);
            }
            ChatEvent::TypingStart {
                created_at,
                user,
                parent_id,
                ..
            } => {
                if user.id != self.current_user_id {
                    let start = TypingStart {
                        user: user.clone(),
                        created_at: *created_at,
                        parent_id: parent_id.clone(),
                    };
                    let snapshot = self.typing.process_event(&user.id, Some(start));
                    state.set_typing(snapshot);
                }
            }
            ChatEvent::TypingStop { user, .. } => {
                if user.id != self.current_user_id {
                    let snapshot = self.typing.process_event(&user.id, None);
                    state.set_typing(snapshot);
                }
            }
            ChatEvent::MessageRead {
                created_at,
                user,
                thread,
                last_read_message_id,
                ..
            } => {
                if thread.is_none() {
                    let read = read_from_event(state, user, *created_at, 0, Some(*created_at), last_read_message_id);
                    state.update_read(read);
                }
            }
            ChatEvent::NotificationMarkRead {
                created_at,
                user,
                thread,
                unread_messages,
                last_read_message_id,
                ..
            } => {
                if thread.is_none() {
                    let read = read_from_event(
                        state,
                        user,
                        *created_at,
                        *unread_messages,
                        Some(*created_at),
                        last_read_message_id,
                    );
                    state.update_read(read);
                }
            }
            ChatEvent::NotificationMarkUnread {
                created_at,
                user,
                unread_messages,
                last_read_at,
                last_read_message_id,
                ..
            } => {
                let read = read_from_event(
                    state,
                    user,
                    *created_at,
                    *unread_messages,
                    *last_read_at,
                    last_read_message_id,
                );
                state.update_read(read);
            }
            ChatEvent::MessageDelivered {
                user,
                last_delivered_at,
                last_delivered_message_id,
                ..
            } => state.update_delivered(ChannelUserRead {
                user: user.clone(),
                last_delivered_at: Some(*last_delivered_at),
                last_delivered_message_id: Some(last_delivered_message_id.clone()),
                ..ChannelUserRead::default()
            }),
            ChatEvent::MarkAllRead { created_at, user } => {
                let read = read_from_event(state, user, *created_at, 0, Some(*created_at), &None);
                state.update_read(read);
            }
            ChatEvent::ChannelUserBanned {
                user,
                expiration,
                shadow,
                ..
            } => state.update_member_ban(&user.id, true, *expiration, *shadow),
            ChatEvent::ChannelUserUnbanned { user, .. } => {
                state.update_member_ban(&user.id, false, None, false);
            }
            ChatEvent::PollClosed { poll, .. } => {
                let closed = Poll {
                    closed: true,
                    ..with_stored_own_votes(state.poll(&poll.id), poll)
                };
                state.upsert_poll(closed);
            }
            ChatEvent::PollUpdated { poll, .. } => {
                let updated = with_stored_own_votes(state.poll(&poll.id), poll);
                state.upsert_poll(updated);
            }
            ChatEvent::PollDeleted { poll, .. } => state.delete_poll(&poll.id),
            ChatEvent::VoteCasted { poll, vote, .. } | ChatEvent::VoteChanged { poll, vote, .. } => {
                let folded = fold_vote(state.poll(&poll.id), poll, vote, &self.current_user_id);
                state.upsert_poll(folded);
            }
            ChatEvent::VoteRemoved { poll, vote, .. } => {
                let folded = remove_vote(state.poll(&poll.id), poll, vote);
                state.upsert_poll(folded);
            }
            ChatEvent::AnswerCasted { poll, answer, .. } => {
                let stored = state.poll(&poll.id);
                let folded = if answer.is_answer() {
                    fold_answer(stored, poll, answer)
                } else {
                    fold_vote(stored, poll, answer, &self.current_user_id)
                };
                state.upsert_poll(folded);
            }
            ChatEvent::ReminderCreated {
                message_id,
                reminder,
                ..
            }
            | ChatEvent::ReminderUpdated {
                message_id,
                reminder,
                ..
            } => set_reminder(state, message_id, Some(reminder.clone())),
            ChatEvent::ReminderDeleted { message_id, .. } => set_reminder(state, message_id, None),
            ChatEvent::UserPresenceChanged { user, .. } | ChatEvent::UserUpdated { user, .. } => {
                state.upsert_user_presence(user);
            }
            ChatEvent::NotificationChannelMutesUpdated { channel_mutes, .. } => {
                self.sync_mute_state(state, channel_mutes);
            }
            ChatEvent::UserMessagesDeleted {
                created_at,
                user,
                hard_delete,
            } => state.delete_messages_from_user(&user.id, *hard_delete, *created_at),
            ChatEvent::Unknown => {
                debug!(cid = %self.cid, "channel: ignoring unknown event");
            }
        }
        None
    }

    /// Recomputes the mute flag from the user's full list of channel mutes.
    pub fn sync_mute_state(&self, state: &mut ChannelState, mutes: &[ChannelMute]) {
        let muted = is_channel_muted(&self.cid, mutes, (self.clock)());
        state.set_muted(muted);
    }

    fn insert_new_message(&self, state: &mut ChannelState, message: Message) -> Message {
        let message = self.enrich(state, message);
        if !message.shadowed {
            state.set_hidden(false);
        }
        state.update_last_message_at(&message);
        let stored = if state.is_inside_search() {
            state.upsert_cached_message(message.clone())
        } else {
            state.upsert_message(message.clone())
        };
        if stored && message.is_pinned((self.clock)()) {
            state.add_pinned_message(message.clone());
        }
        message
    }

    /// Carries forward what the stored copy knows and the payload may omit:
    /// the optimistic creation time of own messages, own reactions, the
    /// poll and the resolved quoted message.
    fn enrich(&self, state: &ChannelState, mut incoming: Message) -> Message {
        let stored = state.get_message_by_id(&incoming.id);
        if incoming.user.id == self.current_user_id {
            incoming.created_locally_at = stored
                .and_then(|stored| stored.created_locally_at)
                .or(incoming.created_locally_at);
        }
        let Some(stored) = stored else {
            return incoming;
        };
        incoming.own_reactions = stored.own_reactions.clone();
        if incoming.poll.is_none() {
            incoming.poll = stored.poll.clone();
        }
        let same_quote = incoming
            .reply_message_id
            .as_ref()
            .map_or(true, |id| stored.quoted_message_id() == Some(id));
        if incoming.reply_to.is_none() && same_quote {
            incoming.reply_to = stored.reply_to.clone();
        }
        incoming
    }

    /// Puts an updated message where it belongs and keeps the pinned list
    /// in sync with its pin state.
    fn store_message(&self, state: &mut ChannelState, message: Message) {
        let visible = state.messages().iter().any(|stored| stored.id == message.id);
        let stored = if state.is_inside_search() && !visible {
            state.upsert_cached_message(message.clone())
        } else {
            state.upsert_message(message.clone())
        };
        if !stored {
            return;
        }
        if message.is_pinned((self.clock)()) {
            state.add_pinned_message(message);
        } else {
            state.delete_pinned_message(&message.id);
        }
    }

    fn apply_reaction(
        &self,
        state: &mut ChannelState,
        message: &Message,
        reaction: &Reaction,
        change: ReactionChange,
    ) {
        if state.get_message_by_id(&message.id).is_none() {
            trace!(cid = %self.cid, message_id = %message.id, "channel: reaction for unknown message");
            return;
        }
        let mut message = self.enrich(state, message.clone());
        if reaction.user_id == self.current_user_id {
            message.own_reactions.retain(|own| own.kind != reaction.kind);
            if change != ReactionChange::Deleted {
                message.own_reactions.push(reaction.clone());
            }
        }
        self.store_message(state, message);
    }

    fn replace_members(&self, state: &mut ChannelState, channel: &ChannelSnapshot) {
        state.set_members(channel.members.clone(), channel.member_count);
        state.set_watchers(channel.watchers.clone(), channel.watcher_count);
        let membership = channel
            .members
            .iter()
            .find(|member| member.user_id() == &self.current_user_id)
            .cloned();
        state.set_membership(membership);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReactionChange {
    Added,
    Updated,
    Deleted,
}

/// Builds the read entry a read event describes. Delivery fields are not
/// part of read events and are kept from the stored entry.
fn read_from_event(
    state: &ChannelState,
    user: &User,
    created_at: DateTime<Utc>,
    unread_messages: u32,
    last_read: Option<DateTime<Utc>>,
    last_read_message_id: &Option<MessageId>,
) -> ChannelUserRead {
    let existing = state.read(&user.id);
    ChannelUserRead {
        user: user.clone(),
        last_received_event_date: Some(created_at),
        unread_messages,
        last_read,
        last_read_message_id: last_read_message_id.clone(),
        last_delivered_at: existing.and_then(|read| read.last_delivered_at),
        last_delivered_message_id: existing.and_then(|read| read.last_delivered_message_id.clone()),
    }
}

fn set_reminder(state: &mut ChannelState, message_id: &MessageId, reminder: Option<MessageReminderInfo>) {
    let Some(message) = state.get_message_by_id(message_id) else {
        return;
    };
    let message = Message {
        reminder,
        ..message.clone()
    };
    state.update_message(message);
}

fn is_channel_muted(cid: &Cid, mutes: &[ChannelMute], now: DateTime<Utc>) -> bool {
    mutes.iter().any(|mute| {
        &mute.channel_cid == cid && mute.expires.map_or(true, |expires| expires > now)
    })
}

fn with_stored_own_votes(stored: Option<&Poll>, incoming: &Poll) -> Poll {
    match stored {
        Some(stored) => Poll {
            own_votes: stored.own_votes.clone(),
            ..incoming.clone()
        },
        None => incoming.clone(),
    }
}

/// Counts come from the event; the vote lists are the stored ones with this
/// vote folded in.
fn fold_vote(stored: Option<&Poll>, incoming: &Poll, vote: &Vote, current_user_id: &UserId) -> Poll {
    let base = stored.unwrap_or(incoming);
    let mut votes = base.votes.clone();
    let mut own_votes = base.own_votes.clone();
    votes.retain(|existing| existing.id != vote.id);
    if incoming.enforce_unique_vote {
        votes.retain(|existing| existing.user_id() != vote.user_id());
    }
    votes.push(vote.clone());
    if vote.user_id() == Some(current_user_id) {
        if incoming.enforce_unique_vote {
            own_votes.clear();
        } else {
            own_votes.retain(|existing| existing.id != vote.id);
        }
        own_votes.push(vote.clone());
    }
    Poll {
        votes,
        own_votes,
        answers: base.answers.clone(),
        ..incoming.clone()
    }
}

fn remove_vote(stored: Option<&Poll>, incoming: &Poll, vote: &Vote) -> Poll {
    let base = stored.unwrap_or(incoming);
    let keep = |existing: &&Vote| existing.id != vote.id;
    Poll {
        votes: base.votes.iter().filter(keep).cloned().collect(),
        own_votes: base.own_votes.iter().filter(keep).cloned().collect(),
        answers: base.answers.iter().filter(keep).cloned().collect(),
        ..incoming.clone()
    }
}

fn fold_answer(stored: Option<&Poll>, incoming: &Poll, answer: &Vote) -> Poll {
    let base = stored.unwrap_or(incoming);
    let mut answers: Vec<Vote> = base
        .answers
        .iter()
        .filter(|existing| existing.id != answer.id)
        .cloned()
        .collect();
    answers.push(answer.clone());
    Poll {
        votes: base.votes.clone(),
        own_votes: base.own_votes.clone(),
        answers,
        ..incoming.clone()
    }
}

#[cfg(test)]
#[path = "tests/handler_tests.rs"]
mod tests;
