//! Folding of channel query results into [`ChannelState`].
//!
//! The outgoing request decides how the returned page lands: a latest query
//! replaces the window, older/newer pages extend it at one end, and an
//! around-id query swaps in a historical window while the live tail is kept
//! aside.

use shared::{
    error::ApiException,
    protocol::{ChannelSnapshot, QueryChannelRequest, QueryDirection},
};
use tracing::{debug, info, warn};

use crate::{error::ErrorClassifier, state::ChannelState};

/// Marks the direction of `request` as loading.
pub fn begin_query(state: &mut ChannelState, request: &QueryChannelRequest) {
    match request.direction() {
        QueryDirection::Older => state.set_loading_older(true),
        QueryDirection::Newer => state.set_loading_newer(true),
        QueryDirection::Latest | QueryDirection::AroundId => {}
    }
}

pub fn apply_query_result(
    state: &mut ChannelState,
    request: &QueryChannelRequest,
    snapshot: ChannelSnapshot,
) {
    let limit = request.messages_limit;
    let size = snapshot.messages.len();
    let direction = request.direction();
    info!(
        cid = %state.cid(),
        ?direction,
        limit,
        size,
        notification = request.is_notification_update,
        "query: applying result"
    );

    let ChannelSnapshot {
        messages,
        pinned_messages,
        ..
    } = apply_channel_metadata(state, snapshot);

    if limit == 0 {
        finish_loading(state);
        return;
    }

    state.set_pinned_messages(pinned_messages);

    if request.is_notification_update {
        if state.is_inside_search() {
            for message in messages {
                state.upsert_cached_message(message);
            }
        } else {
            state.upsert_messages(messages, false);
        }
        finish_loading(state);
        return;
    }

    let end_reached = limit as usize > size;
    match direction {
        QueryDirection::Latest => {
            state.set_messages(messages);
            state.clear_cached_latest_messages();
            state.set_inside_search(false);
            state.set_end_of_older(end_reached);
            state.set_end_of_newer(true);
        }
        QueryDirection::AroundId => {
            if !state.is_inside_search() {
                state.cache_latest_messages();
            }
            state.set_messages(messages);
            state.set_inside_search(true);
            state.set_end_of_older(false);
            state.set_end_of_newer(false);
        }
        QueryDirection::Older => {
            state.upsert_messages(messages, false);
            state.trim_newest_messages();
            state.set_end_of_older(end_reached);
        }
        QueryDirection::Newer => {
            state.upsert_messages(messages, false);
            state.trim_oldest_messages();
            state.set_end_of_newer(end_reached);
            if end_reached {
                state.clear_cached_latest_messages();
                state.set_inside_search(false);
            }
        }
    }

    state.set_recovery_needed(false);
    finish_loading(state);
}

/// Records a failed query. Temporary failures flag the channel for a later
/// resync; permanent ones leave the state as it was.
pub fn apply_query_error(
    state: &mut ChannelState,
    request: &QueryChannelRequest,
    error: &ApiException,
    classifier: &dyn ErrorClassifier,
) {
    let permanent = classifier.is_permanent(error);
    warn!(
        cid = %state.cid(),
        direction = ?request.direction(),
        permanent,
        error = %error,
        "query: request failed"
    );
    if !permanent {
        state.set_recovery_needed(true);
    }
    finish_loading(state);
}

/// Merges a snapshot that did not come from a pagination request, such as
/// one restored from local storage. Pagination flags stay untouched.
pub fn apply_local_snapshot(state: &mut ChannelState, snapshot: ChannelSnapshot) {
    debug!(cid = %state.cid(), messages = snapshot.messages.len(), "query: applying local snapshot");
    let ChannelSnapshot {
        messages,
        pinned_messages,
        ..
    } = apply_channel_metadata(state, snapshot);
    state.add_pinned_messages(pinned_messages);
    state.upsert_messages(messages, false);
}

/// Applies everything but messages and returns the snapshot with its message
/// lists still in place.
fn apply_channel_metadata(state: &mut ChannelState, mut snapshot: ChannelSnapshot) -> ChannelSnapshot {
    state.set_channel_data(std::mem::take(&mut snapshot.data));
    state.set_config(snapshot.config.clone());
    state.set_members(std::mem::take(&mut snapshot.members), snapshot.member_count);
    state.set_watchers(std::mem::take(&mut snapshot.watchers), snapshot.watcher_count);
    state.update_reads(std::mem::take(&mut snapshot.reads));
    if let Some(hidden) = snapshot.hidden {
        state.set_hidden(hidden);
    }
    if snapshot.hidden_messages_before.is_some() {
        state.set_hidden_messages_before(snapshot.hidden_messages_before);
    }
    snapshot
}

fn finish_loading(state: &mut ChannelState) {
    state.set_loading_older(false);
    state.set_loading_newer(false);
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
