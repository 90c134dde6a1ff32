use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(PollId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidParseError {
    #[error("cid must have the form type:id, got {0:?}")]
    MissingSeparator(String),
    #[error("cid {0:?} has an empty type or id")]
    EmptyPart(String),
}

/// Composite channel identifier, rendered as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    pub channel_type: String,
    pub channel_id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((channel_type, channel_id)) = raw.split_once(':') else {
            return Err(CidParseError::MissingSeparator(raw.to_string()));
        };
        if channel_type.is_empty() || channel_id.is_empty() {
            return Err(CidParseError::EmptyPart(raw.to_string()));
        }
        Ok(Self::new(channel_type, channel_id))
    }
}

impl TryFrom<String> for Cid {
    type Error = CidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cid> for String {
    fn from(value: Cid) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: UserId,
    pub name: Option<String>,
    pub online: bool,
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Completed,
    SyncNeeded,
    InProgress,
    AwaitingAttachments,
    FailedPermanently,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Regular,
    System,
    Ephemeral,
    Error,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub score: u32,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageReminderInfo {
    pub remind_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollOption {
    pub id: String,
    pub text: String,
}

/// A poll vote. Free-text answers use the same shape with `answer_text` set
/// and no `option_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vote {
    pub id: String,
    pub poll_id: PollId,
    pub option_id: Option<String>,
    pub answer_text: Option<String>,
    pub user: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Vote {
    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref().map(|user| &user.id)
    }

    pub fn is_answer(&self) -> bool {
        self.answer_text.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Poll {
    pub id: PollId,
    pub name: String,
    pub options: Vec<PollOption>,
    pub votes: Vec<Vote>,
    pub own_votes: Vec<Vote>,
    pub answers: Vec<Vote>,
    pub vote_counts_by_option: HashMap<String, u32>,
    pub vote_count: u32,
    pub answers_count: u32,
    pub enforce_unique_vote: bool,
    pub closed: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub user: User,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub attachments: Vec<Attachment>,
    pub sync_status: SyncStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_locally_at: Option<DateTime<Utc>>,
    pub updated_locally_at: Option<DateTime<Utc>>,
    pub parent_id: Option<MessageId>,
    pub show_in_channel: bool,
    pub shadowed: bool,
    pub silent: bool,
    pub own_reactions: Vec<Reaction>,
    pub latest_reactions: Vec<Reaction>,
    pub reaction_counts: HashMap<String, u32>,
    pub pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub pin_expires: Option<DateTime<Utc>>,
    pub pinned_by: Option<User>,
    pub reminder: Option<MessageReminderInfo>,
    pub poll: Option<Poll>,
    pub reply_to: Option<Box<Message>>,
    pub reply_message_id: Option<MessageId>,
}

impl Message {
    /// Creation time used to order the message list: the server timestamp
    /// once known, the optimistic local one before that.
    pub fn created_at_or_local(&self) -> Option<DateTime<Utc>> {
        self.created_at.or(self.created_locally_at)
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        [self.created_at, self.updated_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn last_local_update_time(&self) -> Option<DateTime<Utc>> {
        [self.created_locally_at, self.updated_locally_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
    }

    /// Server timestamps for acknowledged messages, local timestamps for
    /// messages still waiting on the server.
    pub fn effective_update_time(&self) -> Option<DateTime<Utc>> {
        if self.sync_status == SyncStatus::Completed {
            self.last_update_time()
        } else {
            self.last_local_update_time()
        }
    }

    pub fn is_pinned(&self, now: DateTime<Utc>) -> bool {
        self.pinned
            && self.deleted_at.is_none()
            && self.pin_expires.map_or(true, |expires| expires > now)
    }

    pub fn quoted_message_id(&self) -> Option<&MessageId> {
        self.reply_to
            .as_ref()
            .map(|quoted| &quoted.id)
            .or(self.reply_message_id.as_ref())
    }

    pub fn is_thread_reply_hidden(&self) -> bool {
        self.parent_id.is_some() && !self.show_in_channel
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageType::System
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    pub user: User,
    pub channel_role: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub banned: bool,
    pub ban_expires: Option<DateTime<Utc>>,
    pub shadow_banned: bool,
}

impl Member {
    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelUserRead {
    pub user: User,
    /// Watermark of the newest message event already folded into
    /// `unread_messages`.
    pub last_received_event_date: Option<DateTime<Utc>>,
    pub unread_messages: u32,
    pub last_read: Option<DateTime<Utc>>,
    pub last_read_message_id: Option<MessageId>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub last_delivered_message_id: Option<MessageId>,
}

impl ChannelUserRead {
    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub read_events_enabled: bool,
    pub typing_events_enabled: bool,
    pub skip_last_msg_update_for_system_msgs: bool,
    pub max_message_length: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_events_enabled: true,
            typing_events_enabled: true,
            skip_last_msg_update_for_system_msgs: false,
            max_message_length: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelData {
    pub name: Option<String>,
    pub image: Option<String>,
    pub created_by: Option<User>,
    pub frozen: bool,
    pub member_count: u32,
    pub message_count: Option<u32>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub own_capabilities: HashSet<String>,
    pub membership: Option<Member>,
}

impl ChannelData {
    /// Folds channel data carried by an event over the current data. Events
    /// do not reliably carry capabilities, membership or the message count,
    /// so the known values survive when the payload leaves them out.
    pub fn merge_from_event(&self, incoming: ChannelData) -> ChannelData {
        ChannelData {
            own_capabilities: if incoming.own_capabilities.is_empty() {
                self.own_capabilities.clone()
            } else {
                incoming.own_capabilities
            },
            membership: self.membership.clone(),
            message_count: incoming.message_count.or(self.message_count),
            last_message_at: incoming.last_message_at.max(self.last_message_at),
            ..incoming
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMute {
    pub channel_cid: Cid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub parent_message_id: MessageId,
}
