use thiserror::Error;

use crate::domain::message::{ChannelId, GroupId, SlackTimestamp};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("group `{0}` has no Slack channel configured")]
    ChannelNotProvisioned(GroupId),
    #[error("unknown group `{0}`")]
    UnknownGroup(GroupId),
    #[error("message {ts} in {channel} was not posted through the bot identity")]
    NotBotAuthored { channel: ChannelId, ts: SlackTimestamp },
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

/// Failures surfaced by the channel synchronizer's async operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("slack request failed: {0}")]
    Slack(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<SyncError> for ApplicationError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Domain(error) => Self::Domain(error),
            SyncError::Slack(message) => Self::Integration(message),
            SyncError::Persistence(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "Only messages sent from this app can be changed.",
            Self::ServiceUnavailable { .. } => {
                "Slack is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::Forbidden { .. } => "forbidden",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::NotBotAuthored { .. }) => {
                Self::Forbidden { message: value.to_string(), correlation_id }
            }
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::message::{ChannelId, SlackTimestamp};
    use crate::errors::{ApplicationError, DomainError, InterfaceError, SyncError};

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::EmptyMessage).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn foreign_message_mutation_maps_to_forbidden() {
        let interface = ApplicationError::from(DomainError::NotBotAuthored {
            channel: ChannelId("C1".into()),
            ts: SlackTimestamp::from("1.0"),
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert_eq!(interface.user_message(), "Only messages sent from this app can be changed.");
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn integration_error_maps_to_service_unavailable() {
        let interface =
            ApplicationError::Integration("ratelimited".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.error_class(), "service_unavailable");
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("invalid bot token".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }

    #[test]
    fn sync_slack_failure_surfaces_as_service_unavailable() {
        let interface = ApplicationError::from(SyncError::Slack("channel_not_found".to_owned()))
            .into_interface("req-5");

        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable { ref message, .. } if message == "channel_not_found"
        ));
    }
}
