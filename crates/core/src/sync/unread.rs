//! Auto-scroll versus unread-badge decisions per channel.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::{ChannelMessage, GroupId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollState {
    AtBottom,
    ScrolledUp,
}

/// Viewport geometry reported by a scroll event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnreadSettings {
    pub threshold_px: f64,
    pub history_cooldown: Duration,
}

impl Default for UnreadSettings {
    fn default() -> Self {
        Self { threshold_px: 100.0, history_cooldown: Duration::milliseconds(2_000) }
    }
}

/// Last-read instants keyed by group, persisted between sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LastReadMap(pub HashMap<GroupId, DateTime<Utc>>);

impl LastReadMap {
    pub fn get(&self, group: &GroupId) -> Option<DateTime<Utc>> {
        self.0.get(group).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub auto_scroll: bool,
    pub unread: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrollTransition {
    pub from: ScrollState,
    pub to: ScrollState,
    pub marked_read: bool,
}

#[derive(Clone, Copy, Debug)]
struct ChannelScroll {
    state: ScrollState,
    unread: usize,
}

impl Default for ChannelScroll {
    fn default() -> Self {
        Self { state: ScrollState::AtBottom, unread: 0 }
    }
}

#[derive(Clone, Debug)]
pub struct ScrollCoordinator {
    settings: UnreadSettings,
    channels: HashMap<GroupId, ChannelScroll>,
    selected: Option<GroupId>,
    last_read: LastReadMap,
    suspended_until: Option<DateTime<Utc>>,
}

impl ScrollCoordinator {
    pub fn new(settings: UnreadSettings, last_read: LastReadMap) -> Self {
        Self { settings, channels: HashMap::new(), selected: None, last_read, suspended_until: None }
    }

    pub fn selected(&self) -> Option<&GroupId> {
        self.selected.as_ref()
    }

    pub fn state(&self, group: &GroupId) -> ScrollState {
        self.channels.get(group).map(|channel| channel.state).unwrap_or(ScrollState::AtBottom)
    }

    pub fn unread(&self, group: &GroupId) -> usize {
        self.channels.get(group).map(|channel| channel.unread).unwrap_or(0)
    }

    pub fn last_read(&self) -> &LastReadMap {
        &self.last_read
    }

    /// Selecting a channel starts it at the bottom, which reads it.
    pub fn select_channel(&mut self, group: &GroupId, now: DateTime<Utc>) {
        self.selected = Some(group.clone());
        self.set_at_bottom(group, now);
    }

    /// Pins the channel to the bottom, as after a local send.
    pub fn force_bottom(&mut self, group: &GroupId, now: DateTime<Utc>) {
        self.set_at_bottom(group, now);
    }

    /// Suspends scroll interpretation while older history is spliced in and
    /// the viewport position is restored.
    pub fn begin_history_load(&mut self, now: DateTime<Utc>) {
        self.suspended_until = Some(now + self.settings.history_cooldown);
    }

    pub fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }

    pub fn on_scroll(
        &mut self,
        group: &GroupId,
        metrics: ScrollMetrics,
        now: DateTime<Utc>,
    ) -> Option<ScrollTransition> {
        if self.is_suspended(now) {
            return None;
        }

        let near_bottom = metrics.distance_from_bottom() <= self.settings.threshold_px;
        let current = self.state(group);
        match (current, near_bottom) {
            (ScrollState::AtBottom, false) => {
                self.channels.entry(group.clone()).or_default().state = ScrollState::ScrolledUp;
                Some(ScrollTransition {
                    from: ScrollState::AtBottom,
                    to: ScrollState::ScrolledUp,
                    marked_read: false,
                })
            }
            (ScrollState::ScrolledUp, true) => {
                self.set_at_bottom(group, now);
                Some(ScrollTransition {
                    from: ScrollState::ScrolledUp,
                    to: ScrollState::AtBottom,
                    marked_read: true,
                })
            }
            _ => None,
        }
    }

    /// Called after every reconciliation of `group`'s list.
    pub fn on_update(
        &mut self,
        group: &GroupId,
        messages: &[ChannelMessage],
        now: DateTime<Utc>,
    ) -> UpdateOutcome {
        let is_selected = self.selected.as_ref() == Some(group);
        if is_selected && self.is_suspended(now) {
            return UpdateOutcome { auto_scroll: false, unread: self.unread(group) };
        }

        if is_selected && self.state(group) == ScrollState::AtBottom {
            self.set_at_bottom(group, now);
            return UpdateOutcome { auto_scroll: true, unread: 0 };
        }

        let unread = self.count_unread(group, messages);
        self.channels.entry(group.clone()).or_default().unread = unread;
        UpdateOutcome { auto_scroll: false, unread }
    }

    fn count_unread(&self, group: &GroupId, messages: &[ChannelMessage]) -> usize {
        let last_read = self.last_read.get(group).unwrap_or_default();
        let (secs, micros) = (last_read.timestamp().max(0) as u64, last_read.timestamp_subsec_micros());

        messages
            .iter()
            .filter(|message| !message.is_placeholder())
            .filter(|message| message.ts.parts() > (secs, micros))
            .count()
    }

    fn set_at_bottom(&mut self, group: &GroupId, now: DateTime<Utc>) {
        let channel = self.channels.entry(group.clone()).or_default();
        channel.state = ScrollState::AtBottom;
        channel.unread = 0;
        let previous = self.last_read.get(group);
        if previous.map_or(true, |previous| previous < now) {
            self.last_read.0.insert(group.clone(), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{LastReadMap, ScrollCoordinator, ScrollMetrics, ScrollState, UnreadSettings};
    use crate::domain::message::{ChannelId, ChannelMessage, GroupId, SlackUserId};

    fn group() -> GroupId {
        GroupId("g-1".into())
    }

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("valid time")
    }

    fn msg(ts: i64) -> ChannelMessage {
        ChannelMessage::new(
            ChannelId("C1".into()),
            SlackUserId("U1".into()),
            format!("{ts}.000100"),
            "x",
        )
    }

    fn scrolled_up() -> ScrollMetrics {
        ScrollMetrics { scroll_top: 0.0, scroll_height: 2_000.0, client_height: 500.0 }
    }

    fn at_bottom() -> ScrollMetrics {
        ScrollMetrics { scroll_top: 1_450.0, scroll_height: 2_000.0, client_height: 500.0 }
    }

    #[test]
    fn updates_at_bottom_auto_scroll_without_unread() {
        let mut coordinator = ScrollCoordinator::new(UnreadSettings::default(), LastReadMap::default());
        coordinator.select_channel(&group(), at(1_000));

        let outcome = coordinator.on_update(&group(), &[msg(1_001), msg(1_002)], at(1_003));

        assert!(outcome.auto_scroll);
        assert_eq!(outcome.unread, 0);
    }

    #[test]
    fn scrolled_up_counts_unseen_then_clears_on_return() {
        let mut coordinator = ScrollCoordinator::new(UnreadSettings::default(), LastReadMap::default());
        coordinator.select_channel(&group(), at(1_000));

        let transition = coordinator.on_scroll(&group(), scrolled_up(), at(1_001));
        assert_eq!(transition.map(|t| t.to), Some(ScrollState::ScrolledUp));

        let messages = vec![msg(900), msg(1_010), msg(1_020), msg(1_030)];
        let outcome = coordinator.on_update(&group(), &messages, at(1_031));
        assert!(!outcome.auto_scroll);
        assert_eq!(outcome.unread, 3);
        assert_eq!(coordinator.unread(&group()), 3);

        let transition = coordinator.on_scroll(&group(), at_bottom(), at(1_040));
        assert!(transition.is_some_and(|t| t.marked_read));
        assert_eq!(coordinator.unread(&group()), 0);
        assert_eq!(coordinator.last_read().get(&group()), Some(at(1_040)));
    }

    #[test]
    fn history_load_suspends_scroll_interpretation() {
        let mut coordinator = ScrollCoordinator::new(UnreadSettings::default(), LastReadMap::default());
        coordinator.select_channel(&group(), at(1_000));
        coordinator.begin_history_load(at(1_000));

        assert_eq!(coordinator.on_scroll(&group(), scrolled_up(), at(1_001)), None);
        assert_eq!(coordinator.state(&group()), ScrollState::AtBottom);
        let outcome = coordinator.on_update(&group(), &[msg(10)], at(1_001));
        assert!(!outcome.auto_scroll);

        let after = at(1_000) + Duration::milliseconds(2_001);
        assert!(coordinator.on_scroll(&group(), scrolled_up(), after).is_some());
    }

    #[test]
    fn background_channels_accumulate_unread() {
        let other = GroupId("g-2".into());
        let mut last_read = LastReadMap::default();
        last_read.0.insert(other.clone(), at(500));
        let mut coordinator = ScrollCoordinator::new(UnreadSettings::default(), last_read);
        coordinator.select_channel(&group(), at(1_000));

        let outcome = coordinator.on_update(&other, &[msg(400), msg(600), msg(700)], at(1_001));

        assert!(!outcome.auto_scroll);
        assert_eq!(outcome.unread, 2);
    }

    #[test]
    fn small_scrolls_within_threshold_stay_at_bottom() {
        let mut coordinator = ScrollCoordinator::new(UnreadSettings::default(), LastReadMap::default());
        coordinator.select_channel(&group(), at(1_000));
        let nearly = ScrollMetrics { scroll_top: 1_420.0, scroll_height: 2_000.0, client_height: 500.0 };

        assert_eq!(coordinator.on_scroll(&group(), nearly, at(1_001)), None);
        assert_eq!(coordinator.state(&group()), ScrollState::AtBottom);
    }
}
