use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use caucus_core::domain::group::{GroupChannel, GroupMember};
use caucus_core::domain::message::{ChannelId, GroupId};
use caucus_core::sync::LastReadMap;

use super::{
    CachedMessages, GroupChannelRepository, MessageCacheRepository, PreferenceRepository,
    ReadStateRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryGroupChannelRepository {
    groups: RwLock<HashMap<String, GroupChannel>>,
    members: RwLock<HashMap<String, Vec<GroupMember>>>,
}

#[async_trait::async_trait]
impl GroupChannelRepository for InMemoryGroupChannelRepository {
    async fn find(&self, group_id: &GroupId) -> Result<Option<GroupChannel>, RepositoryError> {
        let groups = self.groups.read().await;
        Ok(groups.get(&group_id.0).cloned())
    }

    async fn find_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<GroupChannel>, RepositoryError> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .find(|group| group.slack_channel_id.as_ref() == Some(channel_id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<GroupChannel>, RepositoryError> {
        let groups = self.groups.read().await;
        let mut all: Vec<GroupChannel> = groups.values().cloned().collect();
        all.sort_by(|left, right| left.group_name.cmp(&right.group_name));
        Ok(all)
    }

    async fn save(&self, group: GroupChannel) -> Result<(), RepositoryError> {
        let mut groups = self.groups.write().await;
        groups.insert(group.group_id.0.clone(), group);
        Ok(())
    }

    async fn members(&self, group_id: &GroupId) -> Result<Vec<GroupMember>, RepositoryError> {
        let members = self.members.read().await;
        Ok(members.get(&group_id.0).cloned().unwrap_or_default())
    }

    async fn save_member(&self, member: GroupMember) -> Result<(), RepositoryError> {
        if !self.groups.read().await.contains_key(&member.group_id.0) {
            return Err(RepositoryError::Decode(format!("unknown group `{}`", member.group_id)));
        }
        let mut members = self.members.write().await;
        let entries = members.entry(member.group_id.0.clone()).or_default();
        entries.retain(|existing| existing.member_id != member.member_id);
        entries.push(member);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryReadStateRepository {
    reads: RwLock<HashMap<String, LastReadMap>>,
}

#[async_trait::async_trait]
impl ReadStateRepository for InMemoryReadStateRepository {
    async fn load(&self, user_id: &str) -> Result<LastReadMap, RepositoryError> {
        let reads = self.reads.read().await;
        Ok(reads.get(user_id).cloned().unwrap_or_default())
    }

    async fn mark_read(
        &self,
        user_id: &str,
        group_id: &GroupId,
        read_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut reads = self.reads.write().await;
        let entry = reads.entry(user_id.to_string()).or_default();
        if entry.get(group_id).map_or(true, |previous| previous < read_at) {
            entry.0.insert(group_id.clone(), read_at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceRepository {
    values: RwLock<HashMap<(String, String), String>>,
}

#[async_trait::async_trait]
impl PreferenceRepository for InMemoryPreferenceRepository {
    async fn get(&self, user_id: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        let values = self.values.read().await;
        Ok(values.get(&(user_id.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, user_id: &str, key: &str, value: &str) -> Result<(), RepositoryError> {
        let mut values = self.values.write().await;
        values.insert((user_id.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMessageCacheRepository {
    entries: RwLock<HashMap<String, CachedMessages>>,
}

#[async_trait::async_trait]
impl MessageCacheRepository for InMemoryMessageCacheRepository {
    async fn load(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<CachedMessages>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&channel_id.0).cloned())
    }

    async fn store(&self, cached: CachedMessages) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(cached.channel_id.0.clone(), cached);
        Ok(())
    }
}
