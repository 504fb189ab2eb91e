//! Author attribution for messages posted through the shared bot identity.
//!
//! Every member posts through one bot user, so the real author travels with
//! the message as Slack message metadata. Older messages only carry a
//! trailing signature line in the text; that line is parsed as a fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::message::{ChannelMessage, MemberRef, SlackUserId};

pub const AUTHOR_METADATA_EVENT: &str = "caucus_member_post";
const SIGNATURE_PREFIX: &str = "— Sent by ";

/// Payload stored under Slack's `metadata.event_payload`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorMetadata {
    pub slack_user_id: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&MemberRef> for AuthorMetadata {
    fn from(member: &MemberRef) -> Self {
        Self {
            slack_user_id: member.slack_user_id.0.clone(),
            first_name: member.first_name.clone(),
            last_name: member.last_name.clone(),
        }
    }
}

impl AuthorMetadata {
    pub fn into_member(self) -> MemberRef {
        MemberRef {
            slack_user_id: SlackUserId(self.slack_user_id),
            first_name: self.first_name,
            last_name: self.last_name,
            photo_url: None,
        }
    }

    /// The `metadata` object for `chat.postMessage`.
    pub fn to_slack_metadata(&self) -> Value {
        serde_json::json!({
            "event_type": AUTHOR_METADATA_EVENT,
            "event_payload": self,
        })
    }

    /// Reads the author back out of a message's `metadata` object.
    pub fn from_slack_metadata(metadata: &Value) -> Option<Self> {
        if metadata.get("event_type").and_then(Value::as_str) != Some(AUTHOR_METADATA_EVENT) {
            return None;
        }
        serde_json::from_value(metadata.get("event_payload")?.clone()).ok()
    }
}

/// Renders the legacy signature line appended to bot-posted text.
pub fn signature_line(author: &MemberRef) -> String {
    format!("_{SIGNATURE_PREFIX}{}_", author.display_name())
}

pub fn sign(text: &str, author: &MemberRef) -> String {
    format!("{}\n\n{}", text.trim_end(), signature_line(author))
}

/// Name on the trailing signature line, if the text has one.
pub fn parse_signature(text: &str) -> Option<&str> {
    let last = text.trim_end().lines().last()?.trim();
    let inner = last.strip_prefix('_').and_then(|rest| rest.strip_suffix('_')).unwrap_or(last);
    let name = inner.strip_prefix(SIGNATURE_PREFIX)?.trim();
    (!name.is_empty()).then_some(name)
}

/// Text without the trailing signature line.
pub fn strip_signature(text: &str) -> &str {
    if parse_signature(text).is_none() {
        return text;
    }
    let trimmed = text.trim_end();
    match trimmed.rfind('\n') {
        Some(index) => trimmed[..index].trim_end(),
        None => "",
    }
}

/// Replacement text for an edit of a bot-posted message, keeping the
/// original author's signature line.
pub fn resign(original: &str, body: &str, author: Option<&MemberRef>) -> String {
    match (author, parse_signature(original)) {
        (Some(author), _) => sign(body, author),
        (None, Some(name)) => format!("{}\n\n_{SIGNATURE_PREFIX}{name}_", body.trim_end()),
        (None, None) => body.to_owned(),
    }
}

/// Whether the message was posted through the bot identity on behalf of a
/// member, which is the only case where it may be edited or deleted.
pub fn is_bot_authored(message: &ChannelMessage, bot_user_id: &SlackUserId) -> bool {
    &message.user == bot_user_id
        && (message.real_author.is_some() || parse_signature(&message.text).is_some())
}

/// Fills `real_author` from metadata, falling back to the signature line
/// matched against known members by display name.
pub fn attribute(
    message: &mut ChannelMessage,
    metadata: Option<&Value>,
    members: &[MemberRef],
) {
    if let Some(author) = metadata.and_then(AuthorMetadata::from_slack_metadata) {
        let known = members.iter().find(|member| member.slack_user_id.0 == author.slack_user_id);
        message.real_author = Some(known.cloned().unwrap_or_else(|| author.into_member()));
        return;
    }

    if let Some(name) = parse_signature(&message.text) {
        message.real_author =
            members.iter().find(|member| member.display_name().eq_ignore_ascii_case(name)).cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        attribute, is_bot_authored, parse_signature, resign, sign, strip_signature,
        AuthorMetadata,
    };
    use crate::domain::message::{ChannelId, ChannelMessage, MemberRef, SlackUserId};

    fn member() -> MemberRef {
        MemberRef {
            slack_user_id: SlackUserId("U42".into()),
            first_name: "Ada".into(),
            last_name: "Martin".into(),
            photo_url: None,
        }
    }

    #[test]
    fn signature_round_trips_through_text() {
        let signed = sign("Meeting at 7pm", &member());

        assert_eq!(parse_signature(&signed), Some("Ada Martin"));
        assert_eq!(strip_signature(&signed), "Meeting at 7pm");
    }

    #[test]
    fn unsigned_text_is_left_alone() {
        assert_eq!(parse_signature("just text"), None);
        assert_eq!(strip_signature("just text"), "just text");
    }

    #[test]
    fn metadata_takes_precedence_over_signature() {
        let bot = SlackUserId("UBOT".into());
        let mut message = ChannelMessage::new(
            ChannelId("C1".into()),
            bot.clone(),
            "10",
            sign("hi", &MemberRef { first_name: "Someone".into(), ..member() }),
        );
        let metadata = AuthorMetadata::from(&member()).to_slack_metadata();

        attribute(&mut message, Some(&metadata), &[member()]);

        assert_eq!(message.real_author, Some(member()));
        assert!(is_bot_authored(&message, &bot));
    }

    #[test]
    fn signature_fallback_matches_known_member() {
        let mut message =
            ChannelMessage::new(ChannelId("C1".into()), SlackUserId("UBOT".into()), "10", sign("hi", &member()));

        attribute(&mut message, None, &[member()]);

        assert_eq!(message.real_author, Some(member()));
    }

    #[test]
    fn messages_from_other_users_are_not_bot_authored() {
        let message = ChannelMessage::new(
            ChannelId("C1".into()),
            SlackUserId("U42".into()),
            "10",
            sign("hi", &member()),
        );

        assert!(!is_bot_authored(&message, &SlackUserId("UBOT".into())));
    }

    #[test]
    fn foreign_metadata_is_ignored() {
        let metadata = serde_json::json!({ "event_type": "other", "event_payload": {} });
        assert_eq!(AuthorMetadata::from_slack_metadata(&metadata), None);
    }

    #[test]
    fn resign_keeps_legacy_signature_without_known_author() {
        let original = "Old text\n\n_— Sent by Sam Reyes_";

        let edited = resign(original, "New text", None);

        assert_eq!(parse_signature(&edited), Some("Sam Reyes"));
        assert_eq!(strip_signature(&edited), "New text");
        assert_eq!(resign("plain", "edited", None), "edited");
        assert_eq!(parse_signature(&resign("plain", "edited", Some(&member()))), Some("Ada Martin"));
    }
}
