//! Merging of fetched message batches into a channel's cached view.
//!
//! Every function here is a pure `(state, batch) -> state` step. After any of
//! them the message list is ascending by numeric timestamp with no duplicate
//! timestamps.

use std::collections::HashSet;

use crate::domain::channel::ChannelState;
use crate::domain::message::{ChannelMessage, SlackTimestamp};

/// Outcome of a refresh merge, used for logging and unread bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub placeholders_dropped: usize,
    pub replaced_window: bool,
    pub new_messages: usize,
}

/// Builds the initial state from server-rendered messages.
pub fn seed(initial: Vec<ChannelMessage>, page_size: usize) -> ChannelState {
    let fetched = initial.len();
    let messages = normalize(initial);
    ChannelState {
        oldest_timestamp: messages.first().map(|message| message.ts.clone()),
        has_more_messages: fetched >= page_size,
        has_loaded_full_messages: fetched >= page_size,
        messages,
        failed_sends: Vec::new(),
    }
}

/// Merges a routine poll result.
///
/// Placeholders are always dropped. When no deep history is loaded the batch
/// replaces the list. Otherwise the batch is authoritative for the window it
/// covers: existing entries older than its earliest timestamp are kept,
/// entries inside the window that the batch no longer carries were deleted
/// upstream and are dropped. An empty batch covers no window and leaves the
/// list alone. The history watermark is never touched here.
pub fn refresh(
    state: &mut ChannelState,
    batch: Vec<ChannelMessage>,
    page_size: usize,
) -> MergeSummary {
    let before = state.messages.len();
    let previous_latest = state
        .messages
        .iter()
        .filter(|message| !message.is_placeholder())
        .map(|message| message.ts.clone())
        .max();

    state.messages.retain(|message| !message.is_placeholder());
    let placeholders_dropped = before - state.messages.len();

    let batch = normalize(batch);
    if batch.is_empty() {
        return MergeSummary { placeholders_dropped, replaced_window: false, new_messages: 0 };
    }
    let new_messages = batch
        .iter()
        .filter(|message| previous_latest.as_ref().map_or(true, |latest| &message.ts > latest))
        .count();

    let replaced_window = state.messages.len() <= page_size;
    if replaced_window {
        state.messages = batch;
    } else {
        let fresh: HashSet<SlackTimestamp> =
            batch.iter().map(|message| message.ts.clone()).collect();
        let window_start = batch[0].ts.clone();
        let mut merged: Vec<ChannelMessage> = std::mem::take(&mut state.messages)
            .into_iter()
            .filter(|message| !fresh.contains(&message.ts) && message.ts < window_start)
            .collect();
        merged.extend(batch);
        state.messages = normalize(merged);
    }

    MergeSummary { placeholders_dropped, replaced_window, new_messages }
}

/// Prepends an older page fetched with `before = oldest_timestamp`.
pub fn prepend_history(state: &mut ChannelState, batch: Vec<ChannelMessage>, page_size: usize) {
    state.has_more_messages = batch.len() >= page_size;
    state.has_loaded_full_messages = true;
    if batch.is_empty() {
        return;
    }

    let older = normalize(batch);
    if let Some(earliest) = older.first().map(|message| message.ts.clone()) {
        let moves_back = state.oldest_timestamp.as_ref().map_or(true, |current| &earliest < current);
        if moves_back {
            state.oldest_timestamp = Some(earliest);
        }
    }

    let mut merged = older;
    merged.append(&mut state.messages);
    state.messages = normalize(merged);
}

/// Sorts ascending and collapses duplicate timestamps, keeping the later
/// occurrence (the fresher copy).
pub fn normalize(messages: Vec<ChannelMessage>) -> Vec<ChannelMessage> {
    let mut seen = HashSet::with_capacity(messages.len());
    let mut unique: Vec<ChannelMessage> =
        messages.into_iter().rev().filter(|message| seen.insert(message.ts.clone())).collect();
    unique.sort_by(|left, right| left.ts.cmp(&right.ts));
    unique
}

/// Holds iff the list is strictly ascending by timestamp.
pub fn is_consistent(messages: &[ChannelMessage]) -> bool {
    messages.windows(2).all(|pair| pair[0].ts < pair[1].ts)
}
