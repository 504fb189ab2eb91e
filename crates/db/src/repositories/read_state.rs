use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use caucus_core::domain::message::GroupId;
use caucus_core::sync::LastReadMap;

use super::{decode_instant, encode_instant, ReadStateRepository, RepositoryError};
use crate::DbPool;

pub struct SqlReadStateRepository {
    pool: DbPool,
}

impl SqlReadStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReadStateRepository for SqlReadStateRepository {
    async fn load(&self, user_id: &str) -> Result<LastReadMap, RepositoryError> {
        let rows = sqlx::query("SELECT group_id, last_read_at FROM read_state WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in &rows {
            let group_id: String =
                row.try_get("group_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let raw: String =
                row.try_get("last_read_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            entries.insert(GroupId(group_id), decode_instant("last_read_at", &raw)?);
        }

        Ok(LastReadMap(entries))
    }

    async fn mark_read(
        &self,
        user_id: &str,
        group_id: &GroupId,
        read_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO read_state (user_id, group_id, last_read_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id, group_id) DO UPDATE SET
                 last_read_at = excluded.last_read_at
             WHERE excluded.last_read_at > read_state.last_read_at",
        )
        .bind(user_id)
        .bind(&group_id.0)
        .bind(encode_instant(read_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use caucus_core::domain::message::GroupId;

    use super::SqlReadStateRepository;
    use crate::repositories::ReadStateRepository;
    use crate::{connect_with_settings, migrations};

    async fn repo() -> SqlReadStateRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlReadStateRepository::new(pool)
    }

    #[tokio::test]
    async fn mark_read_never_moves_backward() {
        let repo = repo().await;
        let group = GroupId("g-1".into());
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time");

        repo.mark_read("member-1", &group, later).await.expect("mark");
        repo.mark_read("member-1", &group, later - Duration::minutes(5)).await.expect("mark");

        let state = repo.load("member-1").await.expect("load");
        assert_eq!(state.get(&group), Some(later));
    }

    #[tokio::test]
    async fn read_state_is_scoped_per_user() {
        let repo = repo().await;
        let group = GroupId("g-1".into());
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time");

        repo.mark_read("member-1", &group, now).await.expect("mark");

        assert!(repo.load("member-2").await.expect("load").0.is_empty());
        assert_eq!(repo.load("member-1").await.expect("load").0.len(), 1);
    }

    #[tokio::test]
    async fn sub_second_instants_survive_storage() {
        let repo = repo().await;
        let group = GroupId("g-1".into());
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time");
        let precise = base + Duration::microseconds(250);

        repo.mark_read("member-1", &group, base).await.expect("mark");
        repo.mark_read("member-1", &group, precise).await.expect("mark");

        assert_eq!(repo.load("member-1").await.expect("load").get(&group), Some(precise));
    }
}
