use shared::{domain::Cid, error::ApiException};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("a watch request for {0} is already running")]
    QueryInProgress(Cid),
    #[error("query failed: {0}")]
    Query(#[from] ApiException),
    #[error("event for {event} routed to channel {channel}")]
    CidMismatch { channel: Cid, event: Cid },
}

/// Decides whether a failed query should leave the channel flagged for
/// recovery.
pub trait ErrorClassifier: Send + Sync {
    fn is_permanent(&self, error: &ApiException) -> bool;
}

/// Classifies by error code and HTTP-like status.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusCodeClassifier;

impl ErrorClassifier for StatusCodeClassifier {
    fn is_permanent(&self, error: &ApiException) -> bool {
        error.is_permanent()
    }
}
