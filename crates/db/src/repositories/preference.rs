use chrono::Utc;

use super::{encode_instant, PreferenceRepository, RepositoryError};
use crate::DbPool;

/// Group id of the channel the user had open last.
pub const LAST_SELECTED_CHANNEL_KEY: &str = "last_selected_channel";

pub struct SqlPreferenceRepository {
    pool: DbPool,
}

impl SqlPreferenceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PreferenceRepository for SqlPreferenceRepository {
    async fn get(&self, user_id: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT pref_value FROM user_preference WHERE user_id = ? AND pref_key = ?",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, user_id: &str, key: &str, value: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO user_preference (user_id, pref_key, pref_value, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, pref_key) DO UPDATE SET
                 pref_value = excluded.pref_value,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .bind(encode_instant(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
