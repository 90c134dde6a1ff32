use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChannelConfig, ChannelData, ChannelMute, ChannelUserRead, Cid, Member, Message,
    MessageId, MessageReminderInfo, Poll, Reaction, ThreadInfo, User, Vote,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AroundId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub direction: Pagination,
    pub message_id: MessageId,
}

/// Which part of the message window a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDirection {
    Latest,
    Older,
    Newer,
    AroundId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryChannelRequest {
    pub messages_limit: u32,
    pub message_filter: Option<MessageFilter>,
    pub watch: bool,
    pub presence: bool,
    /// Replace the visible window instead of merging into it.
    pub should_refresh: bool,
    /// Snapshot fetched because of a push notification, not a page request.
    pub is_notification_update: bool,
}

impl QueryChannelRequest {
    pub fn latest(limit: u32) -> Self {
        Self {
            messages_limit: limit,
            watch: true,
            should_refresh: true,
            ..Self::default()
        }
    }

    pub fn older(limit: u32, base_message_id: Option<MessageId>) -> Self {
        Self::filtered(limit, Pagination::LessThan, base_message_id)
    }

    pub fn newer(limit: u32, base_message_id: Option<MessageId>) -> Self {
        Self::filtered(limit, Pagination::GreaterThan, base_message_id)
    }

    pub fn around_id(limit: u32, message_id: MessageId) -> Self {
        Self::filtered(limit, Pagination::AroundId, Some(message_id))
    }

    fn filtered(limit: u32, direction: Pagination, base_message_id: Option<MessageId>) -> Self {
        Self {
            messages_limit: limit,
            message_filter: base_message_id.map(|message_id| MessageFilter {
                direction,
                message_id,
            }),
            watch: true,
            ..Self::default()
        }
    }

    pub fn direction(&self) -> QueryDirection {
        match self.message_filter.as_ref().map(|filter| filter.direction) {
            None => QueryDirection::Latest,
            Some(Pagination::LessThan | Pagination::LessThanOrEqual) => QueryDirection::Older,
            Some(Pagination::GreaterThan | Pagination::GreaterThanOrEqual) => {
                QueryDirection::Newer
            }
            Some(Pagination::AroundId) => QueryDirection::AroundId,
        }
    }

    pub fn is_filtering_messages(&self) -> bool {
        self.message_filter.is_some()
    }
}

/// Point-in-time state of one channel as returned by a query, or as loaded
/// from a local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub cid: Cid,
    #[serde(default)]
    pub data: ChannelData,
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pinned_messages: Vec<Message>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub watchers: Vec<User>,
    #[serde(default)]
    pub watcher_count: u32,
    #[serde(default)]
    pub reads: Vec<ChannelUserRead>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub hidden_messages_before: Option<DateTime<Utc>>,
}

impl ChannelSnapshot {
    pub fn empty(cid: Cid) -> Self {
        Self {
            cid,
            data: ChannelData::default(),
            config: ChannelConfig::default(),
            messages: Vec::new(),
            pinned_messages: Vec::new(),
            members: Vec::new(),
            member_count: 0,
            watchers: Vec::new(),
            watcher_count: 0,
            reads: Vec::new(),
            hidden: None,
            hidden_messages_before: None,
        }
    }
}

/// Real-time events already decoded by the mapping layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "message.new")]
    NewMessage {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
        #[serde(default)]
        channel_message_count: Option<u32>,
    },
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
    },
    #[serde(rename = "notification.thread_message_new")]
    NotificationThreadMessageNew {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
    },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
        #[serde(default)]
        hard_delete: bool,
        #[serde(default)]
        channel_message_count: Option<u32>,
    },
    #[serde(rename = "reaction.new")]
    ReactionNew {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
        reaction: Reaction,
    },
    #[serde(rename = "reaction.updated")]
    ReactionUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
        reaction: Reaction,
    },
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted {
        cid: Cid,
        created_at: DateTime<Utc>,
        message: Message,
        reaction: Reaction,
    },
    #[serde(rename = "member.added")]
    MemberAdded {
        cid: Cid,
        created_at: DateTime<Utc>,
        member: Member,
    },
    #[serde(rename = "member.updated")]
    MemberUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        member: Member,
    },
    #[serde(rename = "member.removed")]
    MemberRemoved {
        cid: Cid,
        created_at: DateTime<Utc>,
        member: Member,
    },
    #[serde(rename = "notification.added_to_channel")]
    NotificationAddedToChannel {
        cid: Cid,
        created_at: DateTime<Utc>,
        channel: ChannelSnapshot,
    },
    #[serde(rename = "notification.removed_from_channel")]
    NotificationRemovedFromChannel {
        cid: Cid,
        created_at: DateTime<Utc>,
        channel: ChannelSnapshot,
    },
    #[serde(rename = "notification.invite_accepted")]
    NotificationInviteAccepted {
        cid: Cid,
        created_at: DateTime<Utc>,
        member: Member,
        channel: ChannelData,
    },
    #[serde(rename = "notification.invite_rejected")]
    NotificationInviteRejected {
        cid: Cid,
        created_at: DateTime<Utc>,
        member: Member,
        channel: ChannelData,
    },
    #[serde(rename = "user.watching.start")]
    UserStartWatching {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        watcher_count: u32,
    },
    #[serde(rename = "user.watching.stop")]
    UserStopWatching {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        watcher_count: u32,
    },
    #[serde(rename = "channel.updated")]
    ChannelUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        channel: ChannelData,
    },
    #[serde(rename = "channel.hidden")]
    ChannelHidden {
        cid: Cid,
        created_at: DateTime<Utc>,
        #[serde(default)]
        clear_history: bool,
    },
    #[serde(rename = "channel.visible")]
    ChannelVisible { cid: Cid, created_at: DateTime<Utc> },
    #[serde(rename = "channel.deleted")]
    ChannelDeleted { cid: Cid, created_at: DateTime<Utc> },
    #[serde(rename = "channel.truncated")]
    ChannelTruncated {
        cid: Cid,
        created_at: DateTime<Utc>,
        #[serde(default)]
        message: Option<Message>,
    },
    #[serde(rename = "notification.channel_truncated")]
    NotificationChannelTruncated { cid: Cid, created_at: DateTime<Utc> },
    #[serde(rename = "typing.start")]
    TypingStart {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        parent_id: Option<MessageId>,
    },
    #[serde(rename = "typing.stop")]
    TypingStop {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        parent_id: Option<MessageId>,
    },
    #[serde(rename = "message.read")]
    MessageRead {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        thread: Option<ThreadInfo>,
        #[serde(default)]
        last_read_message_id: Option<MessageId>,
    },
    #[serde(rename = "notification.mark_read")]
    NotificationMarkRead {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        thread: Option<ThreadInfo>,
        #[serde(default)]
        unread_messages: u32,
        #[serde(default)]
        last_read_message_id: Option<MessageId>,
    },
    #[serde(rename = "notification.mark_unread")]
    NotificationMarkUnread {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        unread_messages: u32,
        #[serde(default)]
        last_read_at: Option<DateTime<Utc>>,
        #[serde(default)]
        last_read_message_id: Option<MessageId>,
    },
    #[serde(rename = "message.delivered")]
    MessageDelivered {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        last_delivered_at: DateTime<Utc>,
        last_delivered_message_id: MessageId,
    },
    #[serde(rename = "notification.mark_all_read")]
    MarkAllRead { created_at: DateTime<Utc>, user: User },
    #[serde(rename = "user.banned")]
    ChannelUserBanned {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        expiration: Option<DateTime<Utc>>,
        #[serde(default)]
        shadow: bool,
    },
    #[serde(rename = "user.unbanned")]
    ChannelUserUnbanned {
        cid: Cid,
        created_at: DateTime<Utc>,
        user: User,
    },
    #[serde(rename = "poll.closed")]
    PollClosed {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
    },
    #[serde(rename = "poll.updated")]
    PollUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
    },
    #[serde(rename = "poll.deleted")]
    PollDeleted {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
    },
    #[serde(rename = "poll.vote_casted")]
    VoteCasted {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
        vote: Vote,
    },
    #[serde(rename = "poll.vote_changed")]
    VoteChanged {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
        vote: Vote,
    },
    #[serde(rename = "poll.vote_removed")]
    VoteRemoved {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
        vote: Vote,
    },
    #[serde(rename = "poll.answer_casted")]
    AnswerCasted {
        cid: Cid,
        created_at: DateTime<Utc>,
        poll: Poll,
        answer: Vote,
    },
    #[serde(rename = "reminder.created")]
    ReminderCreated {
        cid: Cid,
        created_at: DateTime<Utc>,
        message_id: MessageId,
        reminder: MessageReminderInfo,
    },
    #[serde(rename = "reminder.updated")]
    ReminderUpdated {
        cid: Cid,
        created_at: DateTime<Utc>,
        message_id: MessageId,
        reminder: MessageReminderInfo,
    },
    #[serde(rename = "reminder.deleted")]
    ReminderDeleted {
        cid: Cid,
        created_at: DateTime<Utc>,
        message_id: MessageId,
    },
    #[serde(rename = "user.presence.changed")]
    UserPresenceChanged { created_at: DateTime<Utc>, user: User },
    #[serde(rename = "user.updated")]
    UserUpdated { created_at: DateTime<Utc>, user: User },
    #[serde(rename = "notification.channel_mutes_updated")]
    NotificationChannelMutesUpdated {
        created_at: DateTime<Utc>,
        channel_mutes: Vec<ChannelMute>,
    },
    #[serde(rename = "user.messages.deleted")]
    UserMessagesDeleted {
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        hard_delete: bool,
    },
    /// Any event type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl ChatEvent {
    /// Channel the event is scoped to; `None` for user-level events that may
    /// touch every channel.
    pub fn cid(&self) -> Option<&Cid> {
        use ChatEvent::*;
        match self {
            NewMessage { cid, .. }
            | NotificationMessageNew { cid, .. }
            | NotificationThreadMessageNew { cid, .. }
            | MessageUpdated { cid, .. }
            | MessageDeleted { cid, .. }
            | ReactionNew { cid, .. }
            | ReactionUpdated { cid, .. }
            | ReactionDeleted { cid, .. }
            | MemberAdded { cid, .. }
            | MemberUpdated { cid, .. }
            | MemberRemoved { cid, .. }
            | NotificationAddedToChannel { cid, .. }
            | NotificationRemovedFromChannel { cid, .. }
            | NotificationInviteAccepted { cid, .. }
            | NotificationInviteRejected { cid, .. }
            | UserStartWatching { cid, .. }
            | UserStopWatching { cid, .. }
            | ChannelUpdated { cid, .. }
            | ChannelHidden { cid, .. }
            | ChannelVisible { cid, .. }
            | ChannelDeleted { cid, .. }
            | ChannelTruncated { cid, .. }
            | NotificationChannelTruncated { cid, .. }
            | TypingStart { cid, .. }
            | TypingStop { cid, .. }
            | MessageRead { cid, .. }
            | NotificationMarkRead { cid, .. }
            | NotificationMarkUnread { cid, .. }
            | MessageDelivered { cid, .. }
            | ChannelUserBanned { cid, .. }
            | ChannelUserUnbanned { cid, .. }
            | PollClosed { cid, .. }
            | PollUpdated { cid, .. }
            | PollDeleted { cid, .. }
            | VoteCasted { cid, .. }
            | VoteChanged { cid, .. }
            | VoteRemoved { cid, .. }
            | AnswerCasted { cid, .. }
            | ReminderCreated { cid, .. }
            | ReminderUpdated { cid, .. }
            | ReminderDeleted { cid, .. } => Some(cid),
            MarkAllRead { .. }
            | UserPresenceChanged { .. }
            | UserUpdated { .. }
            | NotificationChannelMutesUpdated { .. }
            | UserMessagesDeleted { .. }
            | Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        use ChatEvent::*;
        match self {
            NewMessage { .. } => "message.new",
            NotificationMessageNew { .. } => "notification.message_new",
            NotificationThreadMessageNew { .. } => "notification.thread_message_new",
            MessageUpdated { .. } => "message.updated",
            MessageDeleted { .. } => "message.deleted",
            ReactionNew { .. } => "reaction.new",
            ReactionUpdated { .. } => "reaction.updated",
            ReactionDeleted { .. } => "reaction.deleted",
            MemberAdded { .. } => "member.added",
            MemberUpdated { .. } => "member.updated",
            MemberRemoved { .. } => "member.removed",
            NotificationAddedToChannel { .. } => "notification.added_to_channel",
            NotificationRemovedFromChannel { .. } => "notification.removed_from_channel",
            NotificationInviteAccepted { .. } => "notification.invite_accepted",
            NotificationInviteRejected { .. } => "notification.invite_rejected",
            UserStartWatching { .. } => "user.watching.start",
            UserStopWatching { .. } => "user.watching.stop",
            ChannelUpdated { .. } => "channel.updated",
            ChannelHidden { .. } => "channel.hidden",
            ChannelVisible { .. } => "channel.visible",
            ChannelDeleted { .. } => "channel.deleted",
            ChannelTruncated { .. } => "channel.truncated",
            NotificationChannelTruncated { .. } => "notification.channel_truncated",
            TypingStart { .. } => "typing.start",
            TypingStop { .. } => "typing.stop",
            MessageRead { .. } => "message.read",
            NotificationMarkRead { .. } => "notification.mark_read",
            NotificationMarkUnread { .. } => "notification.mark_unread",
            MessageDelivered { .. } => "message.delivered",
            MarkAllRead { .. } => "notification.mark_all_read",
            ChannelUserBanned { .. } => "user.banned",
            ChannelUserUnbanned { .. } => "user.unbanned",
            PollClosed { .. } => "poll.closed",
            PollUpdated { .. } => "poll.updated",
            PollDeleted { .. } => "poll.deleted",
            VoteCasted { .. } => "poll.vote_casted",
            VoteChanged { .. } => "poll.vote_changed",
            VoteRemoved { .. } => "poll.vote_removed",
            AnswerCasted { .. } => "poll.answer_casted",
            ReminderCreated { .. } => "reminder.created",
            ReminderUpdated { .. } => "reminder.updated",
            ReminderDeleted { .. } => "reminder.deleted",
            UserPresenceChanged { .. } => "user.presence.changed",
            UserUpdated { .. } => "user.updated",
            NotificationChannelMutesUpdated { .. } => "notification.channel_mutes_updated",
            UserMessagesDeleted { .. } => "user.messages.deleted",
            Unknown => "unknown",
        }
    }
}
