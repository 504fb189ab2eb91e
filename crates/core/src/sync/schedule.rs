//! Decides which channels are due for a silent refresh.

use chrono::{DateTime, Duration, Utc};

use crate::domain::message::{ChannelId, GroupId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollIntervals {
    pub active: Duration,
    pub background: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self { active: Duration::seconds(5), background: Duration::seconds(60) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSizes {
    pub full: usize,
    pub short: usize,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self { full: 50, short: 5 }
    }
}

/// In-flight work that must not race with an active-channel poll. Sends and
/// post-send reloads can overlap, so they are counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncGuards {
    pub sends_in_flight: usize,
    pub loading_history: bool,
    pub reloads_after_send: usize,
}

impl SyncGuards {
    pub fn blocks_active_poll(&self) -> bool {
        self.sends_in_flight > 0 || self.loading_history || self.reloads_after_send > 0
    }

    pub fn begin_send(&mut self) {
        self.sends_in_flight += 1;
    }

    /// Ends one send. A successful one hands over to its post-send reload.
    pub fn end_send(&mut self, reload_follows: bool) {
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        if reload_follows {
            self.reloads_after_send += 1;
        }
    }

    pub fn end_reload(&mut self) {
        self.reloads_after_send = self.reloads_after_send.saturating_sub(1);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledChannel {
    pub group_id: GroupId,
    pub channel_id: Option<ChannelId>,
    pub has_loaded_full_messages: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollKind {
    Active,
    Background,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollRequest {
    pub group_id: GroupId,
    pub channel_id: ChannelId,
    pub limit: usize,
    pub kind: PollKind,
}

#[derive(Clone, Debug)]
pub struct PollSchedule {
    intervals: PollIntervals,
    pages: PageSizes,
    last_active: Option<DateTime<Utc>>,
    last_background: Option<DateTime<Utc>>,
}

impl PollSchedule {
    pub fn new(intervals: PollIntervals, pages: PageSizes, started_at: DateTime<Utc>) -> Self {
        Self { intervals, pages, last_active: Some(started_at), last_background: Some(started_at) }
    }

    pub fn intervals(&self) -> PollIntervals {
        self.intervals
    }

    /// Page size for an active-channel refresh: the short page until the
    /// full page has been loaded once.
    pub fn active_limit(&self, has_loaded_full_messages: bool) -> usize {
        if has_loaded_full_messages {
            self.pages.full
        } else {
            self.pages.short
        }
    }

    /// Returns the polls due at `now` and advances the timers. A guarded
    /// active tick is consumed without a request, matching an interval timer
    /// whose callback bails out early.
    pub fn due(
        &mut self,
        now: DateTime<Utc>,
        selected: Option<&GroupId>,
        channels: &[ScheduledChannel],
        guards: SyncGuards,
    ) -> Vec<PollRequest> {
        let mut requests = Vec::new();

        if elapsed(self.last_active, now, self.intervals.active) {
            self.last_active = Some(now);
            if !guards.blocks_active_poll() {
                let active = selected
                    .and_then(|group| channels.iter().find(|channel| &channel.group_id == group));
                if let Some(channel) = active {
                    if let Some(channel_id) = &channel.channel_id {
                        requests.push(PollRequest {
                            group_id: channel.group_id.clone(),
                            channel_id: channel_id.clone(),
                            limit: self.active_limit(channel.has_loaded_full_messages),
                            kind: PollKind::Active,
                        });
                    }
                }
            }
        }

        if elapsed(self.last_background, now, self.intervals.background) {
            self.last_background = Some(now);
            requests.extend(
                channels
                    .iter()
                    .filter(|channel| Some(&channel.group_id) != selected)
                    .filter_map(|channel| {
                        channel.channel_id.as_ref().map(|channel_id| PollRequest {
                            group_id: channel.group_id.clone(),
                            channel_id: channel_id.clone(),
                            limit: self.pages.short,
                            kind: PollKind::Background,
                        })
                    }),
            );
        }

        requests
    }
}

fn elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    last.map_or(true, |last| now - last >= interval)
}
