//! Client-side state reconciliation for chat channels.
//!
//! [`ChannelLogic`] owns one channel: it folds push events through
//! [`ChannelEventHandler`], merges paginated query results and keeps the
//! unread count and typing users current in [`ChannelState`].

pub mod config;
pub mod error;
pub mod handler;
pub mod logic;
pub mod query;
pub mod state;
pub mod typing;
pub mod unread;

pub use config::{load_settings, StateSettings};
pub use error::{ChannelError, ErrorClassifier, StatusCodeClassifier};
pub use handler::ChannelEventHandler;
pub use logic::{ChannelLogic, ChannelQueryApi, MissingChannelQueryApi};
pub use state::{ChannelState, ChannelStateChange, PaginationFlags};
pub use typing::{TypingEventPruner, TypingSnapshot};
pub use unread::UnreadCountBuffer;
