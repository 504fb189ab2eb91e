//! Async driver that owns every channel's state and runs the poll schedule.
//!
//! All state lives behind one async mutex. The lock is never held across a
//! Slack call: an operation snapshots what it needs, releases the lock for the
//! network round trip, then re-acquires it to merge the result. Guards in
//! [`SyncGuards`] keep the active poll from racing a send or a history load.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caucus_core::clock::Clock;
use caucus_core::config::SyncConfig;
use caucus_core::domain::channel::{ChannelState, MessageLifecycle};
use caucus_core::domain::message::{
    ChannelId, ChannelMessage, GroupId, MemberRef, SlackTimestamp, SlackUserId,
};
use caucus_core::errors::{DomainError, SyncError};
use caucus_core::signature;
use caucus_core::sync::reconcile;
use caucus_core::sync::{
    LastReadMap, MergeSummary, PageSizes, PendingFile, PlaceholderManager, PollIntervals,
    PollSchedule, ScheduledChannel, ScrollCoordinator, ScrollMetrics, ScrollState,
    ScrollTransition, SyncGuards, UnreadSettings,
};
use caucus_db::repositories::{
    PreferenceRepository, ReadStateRepository, RepositoryError, LAST_SELECTED_CHANNEL_KEY,
};

use crate::realtime::{ActivityNotification, NotificationHandler};
use crate::web::{FileUpload, MutationError, SlackApi, SlackApiError};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct SynchronizerSettings {
    pub intervals: PollIntervals,
    pub pages: PageSizes,
    pub unread: UnreadSettings,
    pub post_send_delay: Duration,
    pub failed_send_ttl: chrono::Duration,
    pub tick_interval: Duration,
}

impl Default for SynchronizerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SynchronizerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            intervals: config.poll_intervals(),
            pages: config.page_sizes(),
            unread: config.unread_settings(),
            post_send_delay: config.post_send_delay(),
            failed_send_ttl: config.failed_send_ttl(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// The member using this synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Viewer {
    /// Application user id; keys read state and preferences.
    pub user_id: String,
    /// Author identity attached to outgoing posts.
    pub member: Option<MemberRef>,
}

pub struct SyncStores {
    pub read_state: Arc<dyn ReadStateRepository>,
    pub preferences: Arc<dyn PreferenceRepository>,
}

/// Server-rendered starting point for one group.
#[derive(Clone, Debug, PartialEq)]
pub struct SeedChannel {
    pub group_id: GroupId,
    pub channel_id: Option<ChannelId>,
    /// Oldest first.
    pub messages: Vec<ChannelMessage>,
    pub members: Vec<MemberRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_name: String,
    pub mimetype: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Updated { group_id: GroupId, message_count: usize, placeholders: usize },
    AutoScroll { group_id: GroupId },
    Unread { group_id: GroupId, count: usize },
    NewMessageToast { group_id: GroupId, user_id: String },
    SendFailed { group_id: GroupId, error: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSnapshot {
    pub group_id: GroupId,
    pub channel_id: Option<ChannelId>,
    pub state: ChannelState,
    pub scroll: ScrollState,
    pub unread: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOutcome {
    pub placeholder_ts: SlackTimestamp,
    pub lifecycle: MessageLifecycle,
}

struct ChannelEntry {
    channel_id: Option<ChannelId>,
    state: ChannelState,
    members: Vec<MemberRef>,
}

struct Inner {
    channels: BTreeMap<GroupId, ChannelEntry>,
    coordinator: ScrollCoordinator,
    schedule: PollSchedule,
    guards: SyncGuards,
    /// Notification refreshes held back while a send is in flight.
    deferred: BTreeSet<GroupId>,
}

impl Inner {
    fn entry(&self, group: &GroupId) -> Result<&ChannelEntry, DomainError> {
        self.channels.get(group).ok_or_else(|| DomainError::UnknownGroup(group.clone()))
    }

    fn entry_mut(&mut self, group: &GroupId) -> Result<&mut ChannelEntry, DomainError> {
        self.channels.get_mut(group).ok_or_else(|| DomainError::UnknownGroup(group.clone()))
    }

    fn channel_id(&self, group: &GroupId) -> Result<ChannelId, DomainError> {
        self.entry(group)?
            .channel_id
            .clone()
            .ok_or_else(|| DomainError::ChannelNotProvisioned(group.clone()))
    }
}

pub struct ChannelSynchronizer {
    api: Arc<dyn SlackApi>,
    stores: SyncStores,
    clock: Arc<dyn Clock>,
    viewer: Viewer,
    bot_user_id: SlackUserId,
    settings: SynchronizerSettings,
    placeholders: PlaceholderManager,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SyncEvent>,
}

fn slack_error(error: SlackApiError) -> SyncError {
    SyncError::Slack(error.to_string())
}

fn persistence_error(error: RepositoryError) -> SyncError {
    SyncError::Persistence(error.to_string())
}

/// Fills `member` from the channel roster and `real_author` from the
/// signature line where metadata did not already provide it.
pub fn enrich(messages: &mut [ChannelMessage], members: &[MemberRef]) {
    for message in messages {
        if message.member.is_none() {
            message.member =
                members.iter().find(|member| member.slack_user_id == message.user).cloned();
        }
        if message.real_author.is_none() {
            signature::attribute(message, None, members);
        }
    }
}

impl ChannelSynchronizer {
    pub async fn open(
        api: Arc<dyn SlackApi>,
        stores: SyncStores,
        clock: Arc<dyn Clock>,
        viewer: Viewer,
        bot_user_id: SlackUserId,
        settings: SynchronizerSettings,
    ) -> Result<Self, SyncError> {
        let last_read: LastReadMap =
            stores.read_state.load(&viewer.user_id).await.map_err(persistence_error)?;
        let now = clock.now();
        let inner = Inner {
            channels: BTreeMap::new(),
            coordinator: ScrollCoordinator::new(settings.unread, last_read),
            schedule: PollSchedule::new(settings.intervals, settings.pages, now),
            guards: SyncGuards::default(),
            deferred: BTreeSet::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            api,
            stores,
            clock,
            viewer,
            bot_user_id,
            settings,
            placeholders: PlaceholderManager,
            inner: Mutex::new(inner),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SynchronizerSettings {
        &self.settings
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_updated(&self, group: &GroupId, state: &ChannelState) {
        self.emit(SyncEvent::Updated {
            group_id: group.clone(),
            message_count: state.messages.len(),
            placeholders: state.placeholder_count(),
        });
    }

    /// Installs server-seeded channels, then restores the last selected
    /// channel (or the first one). Returns the selected group.
    pub async fn seed(&self, channels: Vec<SeedChannel>) -> Result<Option<GroupId>, SyncError> {
        {
            let mut inner = self.inner.lock().await;
            for seed in channels {
                let mut messages = seed.messages;
                enrich(&mut messages, &seed.members);
                let state = reconcile::seed(messages, self.settings.pages.full);
                self.emit_updated(&seed.group_id, &state);
                inner.channels.insert(
                    seed.group_id,
                    ChannelEntry { channel_id: seed.channel_id, state, members: seed.members },
                );
            }
        }

        let remembered = match self
            .stores
            .preferences
            .get(&self.viewer.user_id, LAST_SELECTED_CHANNEL_KEY)
            .await
        {
            Ok(value) => value.map(GroupId),
            Err(error) => {
                warn!(
                    event_name = "sync.preferences.load_failed",
                    error = %error,
                    "could not load last selected channel"
                );
                None
            }
        };

        let target = {
            let inner = self.inner.lock().await;
            remembered
                .filter(|group| inner.channels.contains_key(group))
                .or_else(|| inner.channels.keys().next().cloned())
        };

        if let Some(group) = &target {
            self.select_channel(group).await?;
        }
        Ok(target)
    }

    /// Makes `group` the active channel. It starts at the bottom, so it is
    /// read. The first selection loads a full page.
    pub async fn select_channel(&self, group: &GroupId) -> Result<(), SyncError> {
        let now = self.clock.now();
        let needs_full_page = {
            let mut inner = self.inner.lock().await;
            let entry = inner.entry(group)?;
            let needs_full_page =
                !entry.state.has_loaded_full_messages && entry.channel_id.is_some();
            inner.coordinator.select_channel(group, now);
            needs_full_page
        };

        self.persist_read(group).await;
        if let Err(error) = self
            .stores
            .preferences
            .set(&self.viewer.user_id, LAST_SELECTED_CHANNEL_KEY, &group.0)
            .await
        {
            warn!(
                event_name = "sync.preferences.save_failed",
                group_id = %group,
                error = %error,
                "could not remember selected channel"
            );
        }
        self.emit(SyncEvent::AutoScroll { group_id: group.clone() });
        self.emit(SyncEvent::Unread { group_id: group.clone(), count: 0 });

        if needs_full_page {
            let correlation_id = Uuid::new_v4().to_string();
            if let Err(error) =
                self.refresh_channel(group, self.settings.pages.full, &correlation_id).await
            {
                warn!(
                    event_name = "sync.select.refresh_failed",
                    correlation_id = %correlation_id,
                    group_id = %group,
                    error = %error,
                    "initial full page load failed; next poll will retry"
                );
            }
        }
        Ok(())
    }

    /// Silent refresh of the selected channel. Skipped while a send, a
    /// post-send reload or a history load is in flight.
    pub async fn refresh_active(&self) -> Result<Option<MergeSummary>, SyncError> {
        let target = {
            let inner = self.inner.lock().await;
            if inner.guards.blocks_active_poll() {
                return Ok(None);
            }
            let Some(group) = inner.coordinator.selected().cloned() else {
                return Ok(None);
            };
            let entry = inner.entry(&group)?;
            if entry.channel_id.is_none() {
                return Ok(None);
            }
            let limit = inner.schedule.active_limit(entry.state.has_loaded_full_messages);
            (group, limit)
        };

        let correlation_id = Uuid::new_v4().to_string();
        self.refresh_channel(&target.0, target.1, &correlation_id).await.map(Some)
    }

    /// Silent short refresh of a channel that is not on screen. Held back
    /// until the send guards clear when one is in flight.
    pub async fn refresh_background(
        &self,
        group: &GroupId,
    ) -> Result<Option<MergeSummary>, SyncError> {
        if self.defer_if_guarded(group).await? {
            return Ok(None);
        }
        let correlation_id = Uuid::new_v4().to_string();
        self.refresh_channel(group, self.settings.pages.short, &correlation_id).await.map(Some)
    }

    /// Queues a refresh of `group` while guards block polling. Returns
    /// whether it was queued.
    async fn defer_if_guarded(&self, group: &GroupId) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().await;
        inner.entry(group)?;
        if !inner.guards.blocks_active_poll() {
            return Ok(false);
        }
        inner.deferred.insert(group.clone());
        debug!(
            event_name = "sync.refresh.deferred",
            group_id = %group,
            "refresh held until in-flight send settles"
        );
        Ok(true)
    }

    /// Runs the refreshes queued by [`Self::defer_if_guarded`] once nothing
    /// blocks polling any more.
    async fn drain_deferred(&self, correlation_id: &str) {
        let pending: Vec<(GroupId, usize)> = {
            let mut inner = self.inner.lock().await;
            if inner.guards.blocks_active_poll() {
                return;
            }
            let selected = inner.coordinator.selected().cloned();
            std::mem::take(&mut inner.deferred)
                .into_iter()
                .map(|group| {
                    let limit = if selected.as_ref() == Some(&group) {
                        self.settings.pages.full
                    } else {
                        self.settings.pages.short
                    };
                    (group, limit)
                })
                .collect()
        };

        for (group, limit) in pending {
            if let Err(error) = self.refresh_channel(&group, limit, correlation_id).await {
                warn!(
                    event_name = "sync.refresh.deferred_failed",
                    correlation_id = %correlation_id,
                    group_id = %group,
                    error = %error,
                    "deferred refresh failed; next poll will retry"
                );
            }
        }
    }

    async fn refresh_channel(
        &self,
        group: &GroupId,
        limit: usize,
        correlation_id: &str,
    ) -> Result<MergeSummary, SyncError> {
        let channel_id = self.inner.lock().await.channel_id(group)?;
        let page = self
            .api
            .conversations_history(&channel_id, limit, None)
            .await
            .map_err(slack_error)?;

        let now = self.clock.now();
        let (summary, outcome) = {
            let mut inner = self.inner.lock().await;
            let Inner { channels, coordinator, .. } = &mut *inner;
            let entry =
                channels.get_mut(group).ok_or_else(|| DomainError::UnknownGroup(group.clone()))?;

            let mut batch = page.messages;
            enrich(&mut batch, &entry.members);
            let full_page = limit >= self.settings.pages.full;
            let first_full_load = full_page && !entry.state.has_loaded_full_messages;
            let summary = reconcile::refresh(&mut entry.state, batch, limit);

            if first_full_load {
                entry.state.has_loaded_full_messages = true;
                entry.state.has_more_messages = page.has_more;
            }
            if entry.state.oldest_timestamp.is_none() {
                entry.state.oldest_timestamp =
                    entry.state.messages.first().map(|message| message.ts.clone());
            }
            entry.state.prune_failed_sends(now, self.settings.failed_send_ttl);

            let outcome = coordinator.on_update(group, &entry.state.messages, now);
            self.emit_updated(group, &entry.state);
            (summary, outcome)
        };

        if outcome.auto_scroll {
            self.emit(SyncEvent::AutoScroll { group_id: group.clone() });
            self.persist_read(group).await;
        } else {
            self.emit(SyncEvent::Unread { group_id: group.clone(), count: outcome.unread });
        }

        debug!(
            event_name = "sync.refresh.applied",
            correlation_id = %correlation_id,
            group_id = %group,
            channel_id = %channel_id,
            limit,
            new_messages = summary.new_messages,
            placeholders_dropped = summary.placeholders_dropped,
            replaced_window = summary.replaced_window,
            "merged channel refresh"
        );
        Ok(summary)
    }

    /// Fetches the page before the history watermark and prepends it.
    /// Returns how many messages came back.
    pub async fn load_more(&self, group: &GroupId) -> Result<usize, SyncError> {
        let now = self.clock.now();
        let (channel_id, before) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id(group)?;
            let entry = inner.entry(group)?;
            if inner.guards.loading_history || !entry.state.has_more_messages {
                return Ok(0);
            }
            let before = entry.state.oldest_timestamp.clone();
            inner.guards.loading_history = true;
            inner.coordinator.begin_history_load(now);
            (channel_id, before)
        };

        let correlation_id = Uuid::new_v4().to_string();
        let fetched = self
            .api
            .conversations_history(&channel_id, self.settings.pages.full, before.as_ref())
            .await;

        let loaded = {
            let mut inner = self.inner.lock().await;
            inner.guards.loading_history = false;
            match fetched {
                Ok(page) => {
                    let entry = inner.entry_mut(group)?;
                    let loaded = page.messages.len();
                    let mut batch = page.messages;
                    enrich(&mut batch, &entry.members);
                    reconcile::prepend_history(&mut entry.state, batch, self.settings.pages.full);
                    self.emit_updated(group, &entry.state);
                    info!(
                        event_name = "sync.history.loaded",
                        correlation_id = %correlation_id,
                        group_id = %group,
                        loaded,
                        has_more = entry.state.has_more_messages,
                        "prepended older messages"
                    );
                    Ok(loaded)
                }
                Err(error) => {
                    warn!(
                        event_name = "sync.history.failed",
                        correlation_id = %correlation_id,
                        group_id = %group,
                        error = %error,
                        "loading older messages failed"
                    );
                    Err(slack_error(error))
                }
            }
        };

        self.drain_deferred(&correlation_id).await;
        loaded
    }

    /// Posts a message with an optimistic placeholder, then reloads the
    /// channel after the propagation delay.
    pub async fn send_message(&self, group: &GroupId, text: &str) -> Result<SendOutcome, SyncError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }

        let now = self.clock.now();
        let (channel_id, placeholder) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id(group)?;
            let mut placeholder = self.placeholders.text(
                &channel_id,
                &self.bot_user_id,
                self.viewer.member.as_ref(),
                body,
                now,
            );
            self.append_placeholder(&mut inner, group, &mut placeholder, now)?;
            (channel_id, placeholder)
        };
        self.after_placeholder(group).await;

        let posted = self
            .api
            .post_message(&channel_id, body, self.viewer.member.as_ref())
            .await
            .map(|_| ())
            .map_err(slack_error);
        self.finish_send(group, placeholder, posted).await
    }

    /// Uploads a file with an optional comment, using the same placeholder
    /// flow as [`Self::send_message`].
    pub async fn upload_file(
        &self,
        group: &GroupId,
        file: OutgoingFile,
        comment: &str,
    ) -> Result<SendOutcome, SyncError> {
        let body = comment.trim();
        let now = self.clock.now();
        let (channel_id, placeholder) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id(group)?;
            let pending = PendingFile { name: file.file_name.clone(), mimetype: file.mimetype.clone() };
            let mut placeholder = self.placeholders.files(
                &channel_id,
                &self.bot_user_id,
                self.viewer.member.as_ref(),
                body,
                &[pending],
                now,
            );
            self.append_placeholder(&mut inner, group, &mut placeholder, now)?;
            (channel_id, placeholder)
        };
        self.after_placeholder(group).await;

        let initial_comment = match self.viewer.member.as_ref() {
            Some(author) if body.is_empty() => Some(signature::signature_line(author)),
            Some(author) => Some(signature::sign(body, author)),
            None => (!body.is_empty()).then(|| body.to_owned()),
        };
        let upload = FileUpload {
            channel: channel_id,
            title: Some(file.file_name.clone()),
            file_name: file.file_name,
            content: file.content,
            initial_comment,
        };
        let uploaded = self.api.upload_file(upload).await.map(|_| ()).map_err(slack_error);
        self.finish_send(group, placeholder, uploaded).await
    }

    fn append_placeholder(
        &self,
        inner: &mut Inner,
        group: &GroupId,
        placeholder: &mut ChannelMessage,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SyncError> {
        let entry = inner.entry_mut(group)?;
        placeholder.ts = self.placeholders.append(&mut entry.state, placeholder.clone());
        self.emit_updated(group, &entry.state);
        inner.guards.begin_send();
        inner.coordinator.force_bottom(group, now);
        Ok(())
    }

    async fn after_placeholder(&self, group: &GroupId) {
        self.emit(SyncEvent::AutoScroll { group_id: group.clone() });
        self.emit(SyncEvent::Unread { group_id: group.clone(), count: 0 });
        self.persist_read(group).await;
    }

    async fn finish_send(
        &self,
        group: &GroupId,
        placeholder: ChannelMessage,
        result: Result<(), SyncError>,
    ) -> Result<SendOutcome, SyncError> {
        let correlation_id = Uuid::new_v4().to_string();
        if let Err(error) = result {
            let now = self.clock.now();
            {
                let mut inner = self.inner.lock().await;
                inner.guards.end_send(false);
                if let Ok(entry) = inner.entry_mut(group) {
                    self.placeholders.mark_failed(
                        &mut entry.state,
                        &placeholder,
                        error.to_string(),
                        now,
                    );
                    self.emit_updated(group, &entry.state);
                }
            }
            warn!(
                event_name = "sync.send.failed",
                correlation_id = %correlation_id,
                group_id = %group,
                error = %error,
                "message send failed"
            );
            self.emit(SyncEvent::SendFailed { group_id: group.clone(), error: error.to_string() });
            self.drain_deferred(&correlation_id).await;
            return Err(error);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.guards.end_send(true);
        }

        tokio::time::sleep(self.settings.post_send_delay).await;
        let reloaded = self.refresh_channel(group, self.settings.pages.full, &correlation_id).await;

        let lifecycle = {
            let mut inner = self.inner.lock().await;
            inner.guards.end_reload();
            // the reload just covered this channel
            inner.deferred.remove(group);
            match inner.entry(group) {
                Ok(entry) => self.placeholders.resolve(&entry.state, &placeholder),
                Err(_) => MessageLifecycle::Discarded,
            }
        };

        if let Err(error) = reloaded {
            warn!(
                event_name = "sync.send.reload_failed",
                correlation_id = %correlation_id,
                group_id = %group,
                error = %error,
                "reload after send failed; placeholder stays until the next poll"
            );
        }
        info!(
            event_name = "sync.send.completed",
            correlation_id = %correlation_id,
            group_id = %group,
            lifecycle = ?lifecycle,
            "message sent"
        );
        self.drain_deferred(&correlation_id).await;
        Ok(SendOutcome { placeholder_ts: placeholder.ts, lifecycle })
    }

    /// Edits a bot-posted message. Local state changes only after Slack
    /// confirms.
    pub async fn edit_message(
        &self,
        group: &GroupId,
        ts: &SlackTimestamp,
        text: &str,
    ) -> Result<(), MutationError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }

        let (channel_id, replacement) = {
            let inner = self.inner.lock().await;
            let channel_id = inner.channel_id(group)?;
            let message = self.mutable_message(&inner, group, &channel_id, ts)?;
            let replacement =
                signature::resign(&message.text, body, message.real_author.as_ref());
            (channel_id, replacement)
        };

        self.api.update_message(&channel_id, ts, &replacement).await?;

        let mut inner = self.inner.lock().await;
        let entry = inner.entry_mut(group)?;
        if let Some(message) = entry.state.messages.iter_mut().find(|message| &message.ts == ts) {
            message.text = replacement;
        }
        self.emit_updated(group, &entry.state);
        info!(
            event_name = "sync.message.edited",
            group_id = %group,
            channel_id = %channel_id,
            ts = %ts,
            "edited message"
        );
        Ok(())
    }

    /// Deletes a bot-posted message once Slack confirms.
    pub async fn delete_message(
        &self,
        group: &GroupId,
        ts: &SlackTimestamp,
    ) -> Result<(), MutationError> {
        let channel_id = {
            let inner = self.inner.lock().await;
            let channel_id = inner.channel_id(group)?;
            self.mutable_message(&inner, group, &channel_id, ts)?;
            channel_id
        };

        self.api.delete_message(&channel_id, ts).await?;

        let mut inner = self.inner.lock().await;
        let entry = inner.entry_mut(group)?;
        entry.state.messages.retain(|message| &message.ts != ts);
        self.emit_updated(group, &entry.state);
        info!(
            event_name = "sync.message.deleted",
            group_id = %group,
            channel_id = %channel_id,
            ts = %ts,
            "deleted message"
        );
        Ok(())
    }

    fn mutable_message<'a>(
        &self,
        inner: &'a Inner,
        group: &GroupId,
        channel_id: &ChannelId,
        ts: &SlackTimestamp,
    ) -> Result<&'a ChannelMessage, MutationError> {
        let message = inner
            .entry(group)?
            .state
            .find(ts)
            .filter(|message| !message.is_placeholder())
            .ok_or_else(|| MutationError::NotFound(ts.clone()))?;
        if !signature::is_bot_authored(message, &self.bot_user_id) {
            return Err(DomainError::NotBotAuthored { channel: channel_id.clone(), ts: ts.clone() }
                .into());
        }
        Ok(message)
    }

    /// Someone else posted: full refresh when the channel is on screen, a
    /// short one otherwise, plus a toast. While a send is in flight the
    /// refresh waits for it, so the placeholder is not stripped early.
    pub async fn on_notification(&self, notification: ActivityNotification) -> Result<(), SyncError> {
        if notification.user_id == self.viewer.user_id {
            return Ok(());
        }

        let group = notification.group_id;
        let selected = {
            let inner = self.inner.lock().await;
            if !inner.channels.contains_key(&group) {
                debug!(
                    event_name = "sync.notification.unknown_group",
                    group_id = %group,
                    "ignoring notification for unknown group"
                );
                return Ok(());
            }
            inner.coordinator.selected() == Some(&group)
        };

        self.emit(SyncEvent::NewMessageToast {
            group_id: group.clone(),
            user_id: notification.user_id,
        });
        if self.defer_if_guarded(&group).await? {
            return Ok(());
        }

        let limit = if selected { self.settings.pages.full } else { self.settings.pages.short };
        let correlation_id = Uuid::new_v4().to_string();
        self.refresh_channel(&group, limit, &correlation_id).await.map(|_| ())
    }

    pub async fn on_scroll(
        &self,
        group: &GroupId,
        metrics: ScrollMetrics,
    ) -> Option<ScrollTransition> {
        let now = self.clock.now();
        let transition = self.inner.lock().await.coordinator.on_scroll(group, metrics, now);

        if let Some(transition) = transition {
            if transition.marked_read {
                self.persist_read(group).await;
                self.emit(SyncEvent::Unread { group_id: group.clone(), count: 0 });
            }
        }
        transition
    }

    /// Runs every poll that is due now. Failures are logged and left for
    /// the next tick. Returns how many polls were attempted.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let requests = {
            let mut inner = self.inner.lock().await;
            let ttl = self.settings.failed_send_ttl;
            for entry in inner.channels.values_mut() {
                entry.state.prune_failed_sends(now, ttl);
            }

            let scheduled: Vec<ScheduledChannel> = inner
                .channels
                .iter()
                .map(|(group_id, entry)| ScheduledChannel {
                    group_id: group_id.clone(),
                    channel_id: entry.channel_id.clone(),
                    has_loaded_full_messages: entry.state.has_loaded_full_messages,
                })
                .collect();
            let selected = inner.coordinator.selected().cloned();
            let guards = inner.guards;
            inner.schedule.due(now, selected.as_ref(), &scheduled, guards)
        };

        let correlation_id = Uuid::new_v4().to_string();
        for request in &requests {
            if let Err(error) =
                self.refresh_channel(&request.group_id, request.limit, &correlation_id).await
            {
                warn!(
                    event_name = "sync.poll.failed",
                    correlation_id = %correlation_id,
                    group_id = %request.group_id,
                    channel_id = %request.channel_id,
                    kind = ?request.kind,
                    error = %error,
                    "poll failed; retrying on next tick"
                );
            }
        }
        requests.len()
    }

    /// Drives [`Self::tick`] until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(event_name = "sync.loop.started", user_id = %self.viewer.user_id, "sync loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(event_name = "sync.loop.stopped", "sync loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub async fn snapshot(&self, group: &GroupId) -> Option<ChannelSnapshot> {
        let inner = self.inner.lock().await;
        let entry = inner.channels.get(group)?;
        Some(ChannelSnapshot {
            group_id: group.clone(),
            channel_id: entry.channel_id.clone(),
            state: entry.state.clone(),
            scroll: inner.coordinator.state(group),
            unread: inner.coordinator.unread(group),
        })
    }

    pub async fn selected(&self) -> Option<GroupId> {
        self.inner.lock().await.coordinator.selected().cloned()
    }

    async fn persist_read(&self, group: &GroupId) {
        let read_at = self.inner.lock().await.coordinator.last_read().get(group);
        let Some(read_at) = read_at else {
            return;
        };
        if let Err(error) =
            self.stores.read_state.mark_read(&self.viewer.user_id, group, read_at).await
        {
            warn!(
                event_name = "sync.read_state.save_failed",
                group_id = %group,
                error = %error,
                "could not persist last-read timestamp"
            );
        }
    }
}

#[async_trait]
impl NotificationHandler for ChannelSynchronizer {
    async fn handle(&self, notification: ActivityNotification) -> Result<(), SyncError> {
        self.on_notification(notification).await
    }
}
