pub mod channel;
pub mod group;
pub mod message;
