use chrono::Utc;
use sqlx::Row;

use caucus_core::domain::group::{GroupChannel, GroupMember};
use caucus_core::domain::message::{ChannelId, GroupId, SlackUserId};

use super::{encode_instant, GroupChannelRepository, RepositoryError};
use crate::DbPool;

pub struct SqlGroupChannelRepository {
    pool: DbPool,
}

impl SqlGroupChannelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Result<GroupChannel, RepositoryError> {
    let group_id: String =
        row.try_get("group_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let group_name: String =
        row.try_get("group_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let slack_channel_id: Option<String> =
        row.try_get("slack_channel_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(GroupChannel {
        group_id: GroupId(group_id),
        group_name,
        slack_channel_id: slack_channel_id.filter(|id| !id.is_empty()).map(ChannelId),
    })
}

fn row_to_member(row: &sqlx::sqlite::SqliteRow) -> Result<GroupMember, RepositoryError> {
    let group_id: String =
        row.try_get("group_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let member_id: String =
        row.try_get("member_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let slack_user_id: Option<String> =
        row.try_get("slack_user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let first_name: String =
        row.try_get("first_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_name: String =
        row.try_get("last_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(GroupMember {
        group_id: GroupId(group_id),
        member_id,
        slack_user_id: slack_user_id.map(SlackUserId),
        first_name,
        last_name,
    })
}

#[async_trait::async_trait]
impl GroupChannelRepository for SqlGroupChannelRepository {
    async fn find(&self, group_id: &GroupId) -> Result<Option<GroupChannel>, RepositoryError> {
        let row = sqlx::query(
            "SELECT group_id, group_name, slack_channel_id FROM group_channel WHERE group_id = ?",
        )
        .bind(&group_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_group).transpose()
    }

    async fn find_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<GroupChannel>, RepositoryError> {
        let row = sqlx::query(
            "SELECT group_id, group_name, slack_channel_id
             FROM group_channel WHERE slack_channel_id = ?",
        )
        .bind(&channel_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_group).transpose()
    }

    async fn list(&self) -> Result<Vec<GroupChannel>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT group_id, group_name, slack_channel_id FROM group_channel ORDER BY group_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_group).collect()
    }

    async fn save(&self, group: GroupChannel) -> Result<(), RepositoryError> {
        let now = encode_instant(Utc::now());
        sqlx::query(
            "INSERT INTO group_channel (group_id, group_name, slack_channel_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(group_id) DO UPDATE SET
                 group_name = excluded.group_name,
                 slack_channel_id = excluded.slack_channel_id,
                 updated_at = excluded.updated_at",
        )
        .bind(&group.group_id.0)
        .bind(&group.group_name)
        .bind(group.slack_channel_id.as_ref().map(|id| id.0.as_str()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT group_id, member_id, slack_user_id, first_name, last_name
             FROM group_member WHERE group_id = ? ORDER BY last_name, first_name",
        )
        .bind(&group_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_member).collect()
    }

    async fn save_member(&self, member: GroupMember) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO group_member (group_id, member_id, slack_user_id, first_name, last_name)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(group_id, member_id) DO UPDATE SET
                 slack_user_id = excluded.slack_user_id,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name",
        )
        .bind(&member.group_id.0)
        .bind(&member.member_id)
        .bind(member.slack_user_id.as_ref().map(|id| id.0.as_str()))
        .bind(&member.first_name)
        .bind(&member.last_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
