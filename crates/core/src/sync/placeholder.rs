//! Optimistic "sending" entries shown before the server confirms a post.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::channel::{ChannelState, FailedSend, MessageLifecycle};
use crate::domain::message::{
    ChannelId, ChannelMessage, FileAttachment, MemberRef, SlackTimestamp, SlackUserId,
    TEMP_FILE_ID_PREFIX,
};

/// A file the user picked for upload, before Slack has assigned it an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFile {
    pub name: String,
    pub mimetype: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PlaceholderManager;

impl PlaceholderManager {
    pub fn text(
        &self,
        channel: &ChannelId,
        user: &SlackUserId,
        author: Option<&MemberRef>,
        text: &str,
        now: DateTime<Utc>,
    ) -> ChannelMessage {
        ChannelMessage {
            user: user.clone(),
            text: text.to_owned(),
            ts: timestamp_at(now),
            channel: channel.clone(),
            member: author.cloned(),
            real_author: author.cloned(),
            files: Vec::new(),
            is_temporary: true,
        }
    }

    pub fn files(
        &self,
        channel: &ChannelId,
        user: &SlackUserId,
        author: Option<&MemberRef>,
        comment: &str,
        files: &[PendingFile],
        now: DateTime<Utc>,
    ) -> ChannelMessage {
        let mut message = self.text(channel, user, author, comment, now);
        message.files = files
            .iter()
            .map(|file| FileAttachment {
                id: format!("{TEMP_FILE_ID_PREFIX}{}", Uuid::new_v4()),
                name: file.name.clone(),
                mimetype: file.mimetype.clone(),
                url_private: None,
                permalink: None,
            })
            .collect();
        message
    }

    /// Appends at the tail. The local clock may trail the newest server
    /// timestamp, so the placeholder is nudged just past it to keep the list
    /// ascending.
    pub fn append(&self, state: &mut ChannelState, mut placeholder: ChannelMessage) -> SlackTimestamp {
        if let Some(latest) = state.latest_timestamp() {
            if &placeholder.ts <= latest {
                let (secs, micros) = latest.parts();
                placeholder.ts = bump(secs, micros);
            }
        }
        let ts = placeholder.ts.clone();
        state.messages.push(placeholder);
        ts
    }

    /// Records a failed send and takes its placeholder out of the message
    /// list. The record is kept even when a refresh already dropped the
    /// placeholder.
    pub fn mark_failed(
        &self,
        state: &mut ChannelState,
        placeholder: &ChannelMessage,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailedSend {
        state
            .messages
            .retain(|message| !(message.is_placeholder() && message.ts == placeholder.ts));
        let failed = FailedSend {
            placeholder_ts: placeholder.ts.clone(),
            text: placeholder.text.clone(),
            error: error.into(),
            failed_at: now,
        };
        state.failed_sends.push(failed.clone());
        failed
    }

    /// Resolves a placeholder against the reconciled list: confirmed when the
    /// server now carries the same text from the same user at an equal or later
    /// timestamp.
    pub fn resolve(&self, state: &ChannelState, placeholder: &ChannelMessage) -> MessageLifecycle {
        if state.messages.iter().any(|message| message.is_placeholder() && message.ts == placeholder.ts)
        {
            return MessageLifecycle::Pending;
        }

        let confirmed = state.messages.iter().any(|message| {
            !message.is_placeholder()
                && message.ts >= placeholder.ts
                && message.user == placeholder.user
                && message_body(&message.text) == message_body(&placeholder.text)
        });
        if confirmed {
            MessageLifecycle::Confirmed
        } else {
            MessageLifecycle::Discarded
        }
    }
}

fn timestamp_at(now: DateTime<Utc>) -> SlackTimestamp {
    SlackTimestamp(format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros()))
}

fn bump(secs: u64, micros: u32) -> SlackTimestamp {
    if micros >= 999_999 {
        SlackTimestamp(format!("{}.000000", secs + 1))
    } else {
        SlackTimestamp(format!("{secs}.{:06}", micros + 1))
    }
}

fn message_body(text: &str) -> &str {
    crate::signature::strip_signature(text).trim()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{PendingFile, PlaceholderManager};
    use crate::domain::channel::{ChannelState, MessageLifecycle};
    use crate::domain::message::{ChannelId, ChannelMessage, SlackTimestamp, SlackUserId};
    use crate::sync::reconcile;

    fn channel() -> ChannelId {
        ChannelId("C1".into())
    }

    fn user() -> SlackUserId {
        SlackUserId("UBOT".into())
    }

    #[test]
    fn text_placeholder_uses_clock_seconds() {
        let now = Utc.timestamp_opt(1_730_000_000, 500_000_000).single().expect("valid time");

        let placeholder = PlaceholderManager.text(&channel(), &user(), None, "hello", now);

        assert!(placeholder.is_temporary);
        assert_eq!(placeholder.ts.as_str(), "1730000000.500000");
    }

    #[test]
    fn file_placeholder_gets_temporary_ids() {
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let files = vec![PendingFile { name: "tract.pdf".into(), mimetype: None }];

        let placeholder = PlaceholderManager.files(&channel(), &user(), None, "", &files, now);

        assert_eq!(placeholder.files.len(), 1);
        assert!(placeholder.files[0].id.starts_with("temp-"));
        assert!(placeholder.is_placeholder());
    }

    #[test]
    fn append_keeps_order_when_local_clock_trails_server() {
        let mut state = ChannelState {
            messages: vec![ChannelMessage::new(channel(), user(), "1730000010.000001", "server")],
            ..ChannelState::default()
        };
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let placeholder = PlaceholderManager.text(&channel(), &user(), None, "mine", now);

        let ts = PlaceholderManager.append(&mut state, placeholder);

        assert_eq!(ts, SlackTimestamp::from("1730000010.000002"));
        assert!(reconcile::is_consistent(&state.messages));
    }

    #[test]
    fn failed_placeholder_leaves_message_list() {
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let mut state = ChannelState::default();
        let mut placeholder = PlaceholderManager.text(&channel(), &user(), None, "x", now);
        placeholder.ts = PlaceholderManager.append(&mut state, placeholder.clone());

        let failed =
            PlaceholderManager.mark_failed(&mut state, &placeholder, "channel_not_found", now);

        assert_eq!(failed.placeholder_ts, placeholder.ts);
        assert!(state.messages.is_empty());
        assert_eq!(state.failed_sends.len(), 1);
        assert_eq!(state.failed_sends[0].error, "channel_not_found");
    }

    #[test]
    fn failure_is_recorded_after_a_refresh_dropped_the_placeholder() {
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let mut state = ChannelState::default();
        let mut placeholder = PlaceholderManager.text(&channel(), &user(), None, "late", now);
        placeholder.ts = PlaceholderManager.append(&mut state, placeholder.clone());
        let server = ChannelMessage::new(channel(), user(), "1729999990.000001", "other");
        reconcile::refresh(&mut state, vec![server], 50);
        assert_eq!(state.placeholder_count(), 0);

        PlaceholderManager.mark_failed(&mut state, &placeholder, "timeout", now);

        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.failed_sends.len(), 1);
        assert_eq!(state.failed_sends[0].text, "late");
    }

    #[test]
    fn placeholder_resolves_after_reconciliation() {
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let mut state = ChannelState::default();
        let placeholder = PlaceholderManager.text(&channel(), &user(), None, "on my way", now);
        PlaceholderManager.append(&mut state, placeholder.clone());
        assert_eq!(PlaceholderManager.resolve(&state, &placeholder), MessageLifecycle::Pending);

        let server_copy =
            ChannelMessage::new(channel(), user(), "1730000001.000100", "on my way");
        reconcile::refresh(&mut state, vec![server_copy], 50);

        assert_eq!(PlaceholderManager.resolve(&state, &placeholder), MessageLifecycle::Confirmed);
    }

    #[test]
    fn placeholder_without_server_copy_is_discarded() {
        let now = Utc.timestamp_opt(1_730_000_000, 0).single().expect("valid time");
        let mut state = ChannelState::default();
        let placeholder = PlaceholderManager.text(&channel(), &user(), None, "lost", now);
        PlaceholderManager.append(&mut state, placeholder.clone());

        reconcile::refresh(&mut state, vec![ChannelMessage::new(channel(), user(), "5", "old")], 50);

        assert_eq!(PlaceholderManager.resolve(&state, &placeholder), MessageLifecycle::Discarded);
    }
}
