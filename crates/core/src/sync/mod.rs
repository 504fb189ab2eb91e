//! Pure building blocks of the channel message synchronizer.
//!
//! - `reconcile` merges fetched batches into a channel's cached list
//! - `placeholder` creates and retires optimistic "sending" entries
//! - `unread` decides auto-scroll versus unread badges
//! - `schedule` decides which channels are due for a silent refresh
//!
//! None of these touch the network or real timers; the async driver lives in
//! `caucus-slack`.

pub mod placeholder;
pub mod reconcile;
pub mod schedule;
pub mod unread;

pub use placeholder::{PendingFile, PlaceholderManager};
pub use reconcile::MergeSummary;
pub use schedule::{
    PageSizes, PollIntervals, PollKind, PollRequest, PollSchedule, ScheduledChannel, SyncGuards,
};
pub use unread::{
    LastReadMap, ScrollCoordinator, ScrollMetrics, ScrollState, ScrollTransition, UnreadSettings,
    UpdateOutcome,
};
