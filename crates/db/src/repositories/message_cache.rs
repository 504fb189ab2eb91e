use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use caucus_core::domain::message::{ChannelId, ChannelMessage};

use super::{decode_instant, encode_instant, MessageCacheRepository, RepositoryError};
use crate::DbPool;

/// Snapshot of a channel's latest page, ascending by timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedMessages {
    pub channel_id: ChannelId,
    pub messages: Vec<ChannelMessage>,
    pub refreshed_at: DateTime<Utc>,
}

pub struct SqlMessageCacheRepository {
    pool: DbPool,
}

impl SqlMessageCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageCacheRepository for SqlMessageCacheRepository {
    async fn load(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<CachedMessages>, RepositoryError> {
        let row = sqlx::query(
            "SELECT messages_json, refreshed_at FROM message_cache WHERE channel_id = ?",
        )
        .bind(&channel_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages_json: String =
            row.try_get("messages_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let refreshed_at: String =
            row.try_get("refreshed_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let messages: Vec<ChannelMessage> = serde_json::from_str(&messages_json)
            .map_err(|e| RepositoryError::Decode(format!("invalid messages_json: {e}")))?;

        Ok(Some(CachedMessages {
            channel_id: channel_id.clone(),
            messages,
            refreshed_at: decode_instant("refreshed_at", &refreshed_at)?,
        }))
    }

    async fn store(&self, cached: CachedMessages) -> Result<(), RepositoryError> {
        let messages_json = serde_json::to_string(&cached.messages)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        sqlx::query(
            "INSERT INTO message_cache (channel_id, messages_json, message_count, refreshed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(channel_id) DO UPDATE SET
                 messages_json = excluded.messages_json,
                 message_count = excluded.message_count,
                 refreshed_at = excluded.refreshed_at",
        )
        .bind(&cached.channel_id.0)
        .bind(messages_json)
        .bind(cached.messages.len() as i64)
        .bind(encode_instant(cached.refreshed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
