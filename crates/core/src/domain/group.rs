use serde::{Deserialize, Serialize};

use crate::domain::message::{ChannelId, GroupId, MemberRef, SlackUserId};

const MAX_CHANNEL_NAME_LEN: usize = 80;

/// An application group and the Slack channel it is mirrored to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChannel {
    pub group_id: GroupId,
    pub group_name: String,
    pub slack_channel_id: Option<ChannelId>,
}

impl GroupChannel {
    pub fn is_provisioned(&self) -> bool {
        self.slack_channel_id.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub member_id: String,
    pub slack_user_id: Option<SlackUserId>,
    pub first_name: String,
    pub last_name: String,
}

impl GroupMember {
    /// The member as a message author, when linked to a Slack account.
    pub fn as_member_ref(&self) -> Option<MemberRef> {
        self.slack_user_id.as_ref().map(|slack_user_id| MemberRef {
            slack_user_id: slack_user_id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            photo_url: None,
        })
    }
}

/// Slack channel names are lowercase, at most 80 chars, and limited to
/// letters, digits, hyphens and underscores.
pub fn channel_name_for(group_name: &str) -> String {
    let mut name = String::with_capacity(group_name.len());
    let mut last_was_dash = true;

    for ch in group_name.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            name.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            name.push('-');
            last_was_dash = true;
        }
    }

    let mut name: String = name.trim_end_matches('-').chars().take(MAX_CHANNEL_NAME_LEN).collect();
    if name.is_empty() {
        name.push_str("group");
    }
    name
}
