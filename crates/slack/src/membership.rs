use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use caucus_core::domain::group::{channel_name_for, GroupChannel};
use caucus_core::domain::message::{ChannelId, SlackUserId};
use caucus_db::repositories::{GroupChannelRepository, RepositoryError};

use crate::web::{SlackApi, SlackApiError};

/// Attempts at a free channel name before giving up (`name`, `name-2`, ...).
const MAX_NAME_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error(transparent)]
    Slack(#[from] SlackApiError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no free channel name for group `{0}`")]
    NameExhausted(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipReport {
    pub invited: Vec<SlackUserId>,
    pub removed: Vec<SlackUserId>,
    pub unchanged: usize,
    pub failures: Vec<(SlackUserId, String)>,
}

pub struct MembershipSync {
    api: Arc<dyn SlackApi>,
    bot_user_id: SlackUserId,
}

impl MembershipSync {
    pub fn new(api: Arc<dyn SlackApi>, bot_user_id: SlackUserId) -> Self {
        Self { api, bot_user_id }
    }

    /// Creates and records a channel for a group that has none yet.
    pub async fn provision_channel(
        &self,
        groups: &dyn GroupChannelRepository,
        group: GroupChannel,
    ) -> Result<GroupChannel, MembershipError> {
        if group.is_provisioned() {
            return Ok(group);
        }

        let base = channel_name_for(&group.group_name);
        let mut created = None;
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let name = if attempt == 1 { base.clone() } else { format!("{base}-{attempt}") };
            match self.api.create_channel(&name).await {
                Ok(channel_id) => {
                    created = Some((name, channel_id));
                    break;
                }
                Err(error) if error.code() == Some("name_taken") => continue,
                Err(error) => return Err(error.into()),
            }
        }

        let Some((name, channel_id)) = created else {
            return Err(MembershipError::NameExhausted(group.group_name));
        };

        info!(
            event_name = "membership.channel.provisioned",
            group_id = %group.group_id,
            channel_id = %channel_id,
            channel_name = %name,
            "created slack channel for group"
        );

        let provisioned = GroupChannel { slack_channel_id: Some(channel_id), ..group };
        groups.save(provisioned.clone()).await?;
        Ok(provisioned)
    }

    /// Invites missing members and removes extra ones. The bot is never
    /// removed. Individual removal failures are reported, not fatal.
    pub async fn sync_members(
        &self,
        channel: &ChannelId,
        desired: &[SlackUserId],
    ) -> Result<MembershipReport, SlackApiError> {
        let current: BTreeSet<SlackUserId> =
            self.api.channel_members(channel).await?.into_iter().collect();
        let desired: BTreeSet<SlackUserId> = desired.iter().cloned().collect();

        let to_invite: Vec<SlackUserId> = desired.difference(&current).cloned().collect();
        let to_remove: Vec<SlackUserId> = current
            .difference(&desired)
            .filter(|user| **user != self.bot_user_id)
            .cloned()
            .collect();

        let mut report = MembershipReport {
            unchanged: desired.intersection(&current).count(),
            ..MembershipReport::default()
        };

        if !to_invite.is_empty() {
            self.api.invite_members(channel, &to_invite).await?;
            report.invited = to_invite;
        }

        for user in to_remove {
            match self.api.kick_member(channel, &user).await {
                Ok(()) => report.removed.push(user),
                Err(error) => {
                    warn!(
                        event_name = "membership.kick.failed",
                        channel_id = %channel,
                        user_id = %user,
                        error = %error,
                        "could not remove member from channel"
                    );
                    report.failures.push((user, error.to_string()));
                }
            }
        }

        info!(
            event_name = "membership.sync.completed",
            channel_id = %channel,
            invited = report.invited.len(),
            removed = report.removed.len(),
            failures = report.failures.len(),
            "synchronized channel membership"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use caucus_core::domain::group::GroupChannel;
    use caucus_core::domain::message::{
        ChannelId, ChannelMessage, GroupId, MemberRef, SlackTimestamp, SlackUserId,
    };
    use caucus_db::repositories::{GroupChannelRepository, InMemoryGroupChannelRepository};

    use super::{MembershipError, MembershipSync};
    use crate::web::{BotIdentity, FileUpload, HistoryPage, SlackApi, SlackApiError};

    #[derive(Default)]
    struct ScriptedMembershipApi {
        state: Mutex<MembershipState>,
    }

    #[derive(Default)]
    struct MembershipState {
        create_results: VecDeque<Result<ChannelId, SlackApiError>>,
        created_names: Vec<String>,
        members: Vec<SlackUserId>,
        invited: Vec<SlackUserId>,
        kicked: Vec<SlackUserId>,
        kick_failures: Vec<SlackUserId>,
    }

    fn unused(method: &str) -> SlackApiError {
        SlackApiError::api(method, "not_scripted")
    }

    #[async_trait]
    impl SlackApi for ScriptedMembershipApi {
        async fn auth_test(&self) -> Result<BotIdentity, SlackApiError> {
            Err(unused("auth.test"))
        }

        async fn conversations_history(
            &self,
            _channel: &ChannelId,
            _limit: usize,
            _latest: Option<&SlackTimestamp>,
        ) -> Result<HistoryPage, SlackApiError> {
            Err(unused("conversations.history"))
        }

        async fn fetch_message(
            &self,
            _channel: &ChannelId,
            _ts: &SlackTimestamp,
        ) -> Result<Option<ChannelMessage>, SlackApiError> {
            Err(unused("conversations.history"))
        }

        async fn post_message(
            &self,
            _channel: &ChannelId,
            _text: &str,
            _author: Option<&MemberRef>,
        ) -> Result<SlackTimestamp, SlackApiError> {
            Err(unused("chat.postMessage"))
        }

        async fn update_message(
            &self,
            _channel: &ChannelId,
            _ts: &SlackTimestamp,
            _text: &str,
        ) -> Result<(), SlackApiError> {
            Err(unused("chat.update"))
        }

        async fn delete_message(
            &self,
            _channel: &ChannelId,
            _ts: &SlackTimestamp,
        ) -> Result<(), SlackApiError> {
            Err(unused("chat.delete"))
        }

        async fn upload_file(&self, _upload: FileUpload) -> Result<String, SlackApiError> {
            Err(unused("files.completeUploadExternal"))
        }

        async fn create_channel(&self, name: &str) -> Result<ChannelId, SlackApiError> {
            let mut state = self.state.lock().await;
            state.created_names.push(name.to_owned());
            state.create_results.pop_front().unwrap_or(Ok(ChannelId("CNEW".into())))
        }

        async fn channel_members(
            &self,
            _channel: &ChannelId,
        ) -> Result<Vec<SlackUserId>, SlackApiError> {
            Ok(self.state.lock().await.members.clone())
        }

        async fn invite_members(
            &self,
            _channel: &ChannelId,
            users: &[SlackUserId],
        ) -> Result<(), SlackApiError> {
            self.state.lock().await.invited.extend_from_slice(users);
            Ok(())
        }

        async fn kick_member(
            &self,
            _channel: &ChannelId,
            user: &SlackUserId,
        ) -> Result<(), SlackApiError> {
            let mut state = self.state.lock().await;
            if state.kick_failures.contains(user) {
                return Err(SlackApiError::api("conversations.kick", "cant_kick_self"));
            }
            state.kicked.push(user.clone());
            Ok(())
        }
    }

    fn user(id: &str) -> SlackUserId {
        SlackUserId(id.to_owned())
    }

    #[tokio::test]
    async fn provision_retries_taken_names_and_persists() {
        let api = Arc::new(ScriptedMembershipApi::default());
        api.state.lock().await.create_results = VecDeque::from(vec![
            Err(SlackApiError::api("conversations.create", "name_taken")),
            Ok(ChannelId("C777".into())),
        ]);
        let repo = InMemoryGroupChannelRepository::default();
        let sync = MembershipSync::new(api.clone(), user("UBOT"));

        let group = GroupChannel {
            group_id: GroupId("g-1".into()),
            group_name: "North Side Caucus".into(),
            slack_channel_id: None,
        };
        let provisioned = sync.provision_channel(&repo, group).await.expect("provision");

        assert_eq!(provisioned.slack_channel_id, Some(ChannelId("C777".into())));
        assert_eq!(
            api.state.lock().await.created_names,
            vec!["north-side-caucus".to_owned(), "north-side-caucus-2".to_owned()]
        );
        let stored = repo.find(&GroupId("g-1".into())).await.expect("find");
        assert_eq!(stored.and_then(|group| group.slack_channel_id), Some(ChannelId("C777".into())));
    }

    #[tokio::test]
    async fn provision_surfaces_other_slack_errors() {
        let api = Arc::new(ScriptedMembershipApi::default());
        api.state.lock().await.create_results =
            VecDeque::from(vec![Err(SlackApiError::api("conversations.create", "restricted_action"))]);
        let sync = MembershipSync::new(api, user("UBOT"));

        let result = sync
            .provision_channel(
                &InMemoryGroupChannelRepository::default(),
                GroupChannel {
                    group_id: GroupId("g-1".into()),
                    group_name: "Caucus".into(),
                    slack_channel_id: None,
                },
            )
            .await;

        assert!(matches!(result, Err(MembershipError::Slack(_))));
    }

    #[tokio::test]
    async fn sync_invites_missing_and_removes_extra_but_not_bot() {
        let api = Arc::new(ScriptedMembershipApi::default());
        {
            let mut state = api.state.lock().await;
            state.members = vec![user("UBOT"), user("U1"), user("U2"), user("U3")];
            state.kick_failures = vec![user("U3")];
        }
        let sync = MembershipSync::new(api.clone(), user("UBOT"));

        let report = sync
            .sync_members(&ChannelId("C1".into()), &[user("U1"), user("U4")])
            .await
            .expect("sync");

        assert_eq!(report.invited, vec![user("U4")]);
        assert_eq!(report.removed, vec![user("U2")]);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!api.state.lock().await.kicked.contains(&user("UBOT")));
    }
}
