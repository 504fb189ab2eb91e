use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::{ChannelMessage, SlackTimestamp};

/// Client-side view of one group's channel.
///
/// `messages` is ordered oldest to newest. `oldest_timestamp` is the history
/// watermark and only ever moves backward.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub messages: Vec<ChannelMessage>,
    pub oldest_timestamp: Option<SlackTimestamp>,
    pub has_more_messages: bool,
    pub has_loaded_full_messages: bool,
    #[serde(default)]
    pub failed_sends: Vec<FailedSend>,
}

impl ChannelState {
    pub fn latest_timestamp(&self) -> Option<&SlackTimestamp> {
        self.messages.last().map(|message| &message.ts)
    }

    pub fn placeholder_count(&self) -> usize {
        self.messages.iter().filter(|message| message.is_placeholder()).count()
    }

    pub fn find(&self, ts: &SlackTimestamp) -> Option<&ChannelMessage> {
        self.messages.iter().find(|message| &message.ts == ts)
    }

    /// Drops failed sends older than `ttl`.
    pub fn prune_failed_sends(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        self.failed_sends.retain(|failed| now - failed.failed_at < ttl);
    }
}

/// A send whose network call failed. Kept out of the message list so a
/// reconciliation pass never resurrects it as a placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSend {
    pub placeholder_ts: SlackTimestamp,
    pub text: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLifecycle {
    Pending,
    Confirmed,
    Discarded,
}
