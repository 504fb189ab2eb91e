use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use caucus_core::domain::group::{GroupChannel, GroupMember};
use caucus_core::domain::message::{ChannelId, GroupId};
use caucus_core::sync::LastReadMap;

pub mod group_channel;
pub mod memory;
pub mod message_cache;
pub mod preference;
pub mod read_state;

pub use group_channel::SqlGroupChannelRepository;
pub use memory::{
    InMemoryGroupChannelRepository, InMemoryMessageCacheRepository, InMemoryPreferenceRepository,
    InMemoryReadStateRepository,
};
pub use message_cache::{CachedMessages, SqlMessageCacheRepository};
pub use preference::{SqlPreferenceRepository, LAST_SELECTED_CHANNEL_KEY};
pub use read_state::SqlReadStateRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait GroupChannelRepository: Send + Sync {
    async fn find(&self, group_id: &GroupId) -> Result<Option<GroupChannel>, RepositoryError>;
    async fn find_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<GroupChannel>, RepositoryError>;
    async fn list(&self) -> Result<Vec<GroupChannel>, RepositoryError>;
    async fn save(&self, group: GroupChannel) -> Result<(), RepositoryError>;
    async fn members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>, RepositoryError>;
    async fn save_member(&self, member: GroupMember) -> Result<(), RepositoryError>;
}

/// Per-user last-read instants, one per group.
#[async_trait]
pub trait ReadStateRepository: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<LastReadMap, RepositoryError>;
    /// Records a read. Never moves an existing instant backward.
    async fn mark_read(
        &self,
        user_id: &str,
        group_id: &GroupId,
        read_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get(&self, user_id: &str, key: &str) -> Result<Option<String>, RepositoryError>;
    async fn set(&self, user_id: &str, key: &str, value: &str) -> Result<(), RepositoryError>;
}

/// Last fetched page per channel, used to seed clients before the first poll.
#[async_trait]
pub trait MessageCacheRepository: Send + Sync {
    async fn load(&self, channel_id: &ChannelId)
        -> Result<Option<CachedMessages>, RepositoryError>;
    async fn store(&self, cached: CachedMessages) -> Result<(), RepositoryError>;
}

/// Fixed-width RFC 3339 so stored instants compare correctly as text.
pub(crate) fn encode_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_instant(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid {column} `{raw}`: {error}")))
}
