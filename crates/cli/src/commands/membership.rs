use caucus_core::domain::group::GroupChannel;
use caucus_core::domain::message::{GroupId, SlackUserId};
use caucus_db::repositories::{GroupChannelRepository, SqlGroupChannelRepository};
use caucus_slack::membership::{MembershipError, MembershipReport, MembershipSync};
use serde::Serialize;

use crate::commands::{connect_slack, execute, open_database, CommandFailure, CommandResult, Exit};

#[derive(Debug, Serialize)]
struct ProvisionDetails {
    group_id: String,
    group_name: String,
    channel_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct MembershipDetails {
    channel_id: String,
    invited: Vec<String>,
    removed: Vec<String>,
    unchanged: usize,
    failures: Vec<(String, String)>,
}

/// `caucus provision`: creates the Slack channel for a group. `name`
/// registers the group first when it is not known yet.
pub fn provision(group: String, name: Option<String>) -> CommandResult {
    execute(
        "provision",
        |config| async move {
            let pool = open_database(&config).await?;
            let outcome = async {
                let (api, identity) = connect_slack(&config).await?;
                let sync = MembershipSync::new(api, identity.user_id);
                let groups = SqlGroupChannelRepository::new(pool.clone());
                provision_group(&sync, &groups, &GroupId(group), name.as_deref()).await
            }
            .await;
            pool.close().await;
            outcome
        },
        |provisioned| {
            let channel = provisioned
                .slack_channel_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            CommandResult::success_with(
                "provision",
                format!("group {} is mirrored to {channel}", provisioned.group_id),
                ProvisionDetails {
                    group_id: provisioned.group_id.0,
                    group_name: provisioned.group_name,
                    channel_id: provisioned.slack_channel_id.map(|channel| channel.0),
                },
            )
        },
    )
}

/// `caucus sync-members`: makes the channel membership match the group.
pub fn sync_members(group: String) -> CommandResult {
    execute(
        "sync-members",
        |config| async move {
            let pool = open_database(&config).await?;
            let outcome = async {
                let (api, identity) = connect_slack(&config).await?;
                let sync = MembershipSync::new(api, identity.user_id);
                let groups = SqlGroupChannelRepository::new(pool.clone());
                reconcile_members(&sync, &groups, &GroupId(group)).await
            }
            .await;
            pool.close().await;
            outcome
        },
        |(channel_id, report)| {
            CommandResult::success_with(
                "sync-members",
                format!(
                    "invited {}, removed {}, {} failed",
                    report.invited.len(),
                    report.removed.len(),
                    report.failures.len()
                ),
                MembershipDetails {
                    channel_id,
                    invited: user_ids(&report.invited),
                    removed: user_ids(&report.removed),
                    unchanged: report.unchanged,
                    failures: report
                        .failures
                        .into_iter()
                        .map(|(user, error)| (user.0, error))
                        .collect(),
                },
            )
        },
    )
}

pub async fn provision_group(
    sync: &MembershipSync,
    groups: &dyn GroupChannelRepository,
    group_id: &GroupId,
    name: Option<&str>,
) -> Result<GroupChannel, CommandFailure> {
    let existing = groups.find(group_id).await.map_err(CommandFailure::database)?;
    let group = match (existing, name.map(str::trim).filter(|name| !name.is_empty())) {
        (Some(group), _) => group,
        (None, Some(name)) => GroupChannel {
            group_id: group_id.clone(),
            group_name: name.to_owned(),
            slack_channel_id: None,
        },
        (None, None) => return Err(unknown_group(group_id)),
    };
    sync.provision_channel(groups, group).await.map_err(membership_failure)
}

/// Returns the channel id alongside the report.
pub async fn reconcile_members(
    sync: &MembershipSync,
    groups: &dyn GroupChannelRepository,
    group_id: &GroupId,
) -> Result<(String, MembershipReport), CommandFailure> {
    let group = groups
        .find(group_id)
        .await
        .map_err(CommandFailure::database)?
        .ok_or_else(|| unknown_group(group_id))?;
    let Some(channel) = group.slack_channel_id else {
        return Err(CommandFailure::new(
            "not_provisioned",
            format!(
                "group {group_id} has no channel yet; run `caucus provision --group {group_id}`"
            ),
            Exit::Runtime,
        ));
    };

    let desired: Vec<SlackUserId> = groups
        .members(group_id)
        .await
        .map_err(CommandFailure::database)?
        .into_iter()
        .filter_map(|member| member.slack_user_id)
        .collect();
    let report = sync
        .sync_members(&channel, &desired)
        .await
        .map_err(|error| CommandFailure::slack("slack", error))?;
    Ok((channel.0, report))
}

fn unknown_group(group_id: &GroupId) -> CommandFailure {
    CommandFailure::new(
        "unknown_group",
        format!("group {group_id} is not registered"),
        Exit::Runtime,
    )
}

fn membership_failure(error: MembershipError) -> CommandFailure {
    match error {
        MembershipError::Repository(error) => CommandFailure::database(error),
        MembershipError::Slack(error) => CommandFailure::slack("slack", error),
        exhausted @ MembershipError::NameExhausted(_) => {
            CommandFailure::slack("channel_name_taken", exhausted)
        }
    }
}

fn user_ids(users: &[SlackUserId]) -> Vec<String> {
    users.iter().map(|user| user.0.clone()).collect()
}
