use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix marking file ids generated client-side before an upload is confirmed.
pub const TEMP_FILE_ID_PREFIX: &str = "temp-";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlackUserId(pub String);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SlackUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slack message timestamp in `seconds.micros` form.
///
/// Slack timestamps are unique per channel and double as message ids. Equality
/// and ordering are numeric so `"100"` and `"100.000000"` identify the same
/// message. Unparseable values order as zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlackTimestamp(pub String);

impl SlackTimestamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_unix_seconds(seconds: f64) -> Self {
        Self(format!("{seconds:.6}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into whole seconds and microseconds for exact comparison.
    pub fn parts(&self) -> (u64, u32) {
        let raw = self.0.trim();
        let (secs, frac) = raw.split_once('.').unwrap_or((raw, ""));
        let Ok(secs) = secs.parse::<u64>() else {
            return (0, 0);
        };

        let digits: String = frac.chars().take(6).collect();
        if !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return (0, 0);
        }
        let micros = format!("{digits:0<6}").parse::<u32>().unwrap_or(0);
        (secs, micros)
    }

    pub fn as_seconds_f64(&self) -> f64 {
        let (secs, micros) = self.parts();
        secs as f64 + f64::from(micros) / 1_000_000.0
    }
}

impl PartialEq for SlackTimestamp {
    fn eq(&self, other: &Self) -> bool {
        self.parts() == other.parts()
    }
}

impl Eq for SlackTimestamp {}

impl std::hash::Hash for SlackTimestamp {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.parts().hash(state);
    }
}

impl PartialOrd for SlackTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlackTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl fmt::Display for SlackTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlackTimestamp {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub slack_user_id: SlackUserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl MemberRef {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_private: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
}

impl FileAttachment {
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_FILE_ID_PREFIX)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub user: SlackUserId,
    pub text: String,
    pub ts: SlackTimestamp,
    pub channel: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_author: Option<MemberRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_temporary: bool,
}

impl ChannelMessage {
    pub fn new(
        channel: ChannelId,
        user: SlackUserId,
        ts: impl Into<SlackTimestamp>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            user,
            text: text.into(),
            ts: ts.into(),
            channel,
            member: None,
            real_author: None,
            files: Vec::new(),
            is_temporary: false,
        }
    }

    /// Client-only entries that a successful poll always supersedes.
    pub fn is_placeholder(&self) -> bool {
        self.is_temporary || self.files.iter().any(FileAttachment::is_temporary)
    }

    /// The human the message should be attributed to.
    pub fn author(&self) -> Option<&MemberRef> {
        self.real_author.as_ref().or(self.member.as_ref())
    }
}

impl From<String> for SlackTimestamp {
    fn from(value: String) -> Self {
        Self(value)
    }
}
