//! Slack side of group messaging.
//!
//! - **Web API** (`web`) - the `SlackApi` seam and its reqwest client
//! - **Synchronizer** (`synchronizer`) - per-user channel cache, polling and
//!   optimistic sends
//! - **Realtime** (`realtime`) - push notifications that trigger early refreshes
//! - **Membership** (`membership`) - channel provisioning and roster sync
//!
//! # Architecture
//!
//! ```text
//! poll tick / notification → ChannelSynchronizer → SlackApi → Slack
//!                                   ↓
//!                     reconcile + unread (caucus-core) → SyncEvent
//! ```

pub mod membership;
pub mod realtime;
pub mod synchronizer;
pub mod web;

pub use synchronizer::{
    ChannelSnapshot, ChannelSynchronizer, OutgoingFile, SeedChannel, SendOutcome, SyncEvent,
    SyncStores, SynchronizerSettings, Viewer,
};
pub use web::{SlackApi, SlackApiError, SlackWebClient};
