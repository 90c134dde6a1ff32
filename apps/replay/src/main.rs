use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use client_core::{config, ChannelLogic, ChannelQueryApi, ChannelState};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::{Cid, UserId},
    error::{ApiException, ErrorCode},
    protocol::{ChannelSnapshot, ChatEvent, QueryChannelRequest},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Replays recorded events and query results into one channel and prints
/// the resulting state as JSON.
#[derive(Parser, Debug)]
struct Cli {
    /// JSON array of replay steps.
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value = "me")]
    current_user: String,
    #[arg(long, default_value = "messaging:general")]
    cid: Cid,
    /// Settings file; defaults to chat_state.toml when present.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum ReplayStep {
    Event {
        event: ChatEvent,
    },
    QueryResult {
        #[serde(default)]
        request: QueryChannelRequest,
        snapshot: ChannelSnapshot,
    },
    QueryError {
        #[serde(default)]
        request: QueryChannelRequest,
        code: ErrorCode,
        #[serde(default)]
        status: Option<u16>,
    },
}

/// Answers each query with the next recorded outcome.
#[derive(Default)]
struct RecordedQueries {
    outcomes: Mutex<VecDeque<Result<ChannelSnapshot, ApiException>>>,
}

#[async_trait]
impl ChannelQueryApi for RecordedQueries {
    async fn query_channel(
        &self,
        cid: &Cid,
        _request: &QueryChannelRequest,
    ) -> Result<ChannelSnapshot, ApiException> {
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(ChannelSnapshot::empty(cid.clone())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => config::load_settings_from(path)?,
        None => config::load_settings(),
    };
    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let steps: Vec<ReplayStep> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid replay file {}", cli.input.display()))?;

    let queries = Arc::new(RecordedQueries::default());
    let logic = ChannelLogic::new(
        cli.cid.clone(),
        UserId::new(cli.current_user),
        &settings,
        queries.clone(),
    );

    info!(cid = %cli.cid, steps = steps.len(), "replay: starting");
    for (index, step) in steps.into_iter().enumerate() {
        match step {
            ReplayStep::Event { event } => {
                if let Err(err) = logic.handle_event(&event).await {
                    warn!(index, error = %err, "replay: event skipped");
                }
            }
            ReplayStep::QueryResult { request, snapshot } => {
                queries.outcomes.lock().await.push_back(Ok(snapshot));
                logic.query(request).await?;
            }
            ReplayStep::QueryError {
                request,
                code,
                status,
            } => {
                let mut error = ApiException::new(code, "recorded failure");
                if let Some(status) = status {
                    error = error.with_status(status);
                }
                queries.outcomes.lock().await.push_back(Err(error));
                if let Err(err) = logic.query(request).await {
                    info!(index, error = %err, "replay: query failed as recorded");
                }
            }
        }
    }
    logic.flush_unread().await;

    let state = logic.state();
    let summary = summarize(&*state.lock().await);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn summarize(state: &ChannelState) -> Value {
    let flags = state.pagination();
    let mut reads: Vec<_> = state.reads().values().collect();
    reads.sort_by(|a, b| a.user_id().cmp(b.user_id()));
    json!({
        "cid": state.cid(),
        "hidden": state.is_hidden(),
        "muted": state.is_muted(),
        "channel": state.data(),
        "messages": state.messages(),
        "cached_latest_messages": state
            .cached_latest_messages()
            .iter()
            .map(|message| &message.id)
            .collect::<Vec<_>>(),
        "pinned_messages": state
            .pinned_messages()
            .iter()
            .map(|message| &message.id)
            .collect::<Vec<_>>(),
        "members": state.members(),
        "member_count": state.member_count(),
        "watchers": state.watchers(),
        "watcher_count": state.watcher_count(),
        "reads": reads,
        "typing": state
            .typing()
            .users
            .iter()
            .map(|user| &user.id)
            .collect::<Vec<_>>(),
        "pagination": {
            "loading_older": flags.loading_older,
            "loading_newer": flags.loading_newer,
            "end_of_older": flags.end_of_older,
            "end_of_newer": flags.end_of_newer,
            "inside_search": flags.inside_search,
            "recovery_needed": flags.recovery_needed,
        },
    })
}
