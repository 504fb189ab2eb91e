pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod signature;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::channel::{ChannelState, FailedSend, MessageLifecycle};
pub use domain::group::{GroupChannel, GroupMember};
pub use domain::message::{
    ChannelId, ChannelMessage, FileAttachment, GroupId, MemberRef, SlackTimestamp, SlackUserId,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, SyncError};
