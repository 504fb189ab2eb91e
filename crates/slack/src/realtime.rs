//! Push notifications of new channel activity.
//!
//! Polling stays the fallback; a notification only triggers an earlier
//! refresh of the affected channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use caucus_core::domain::message::{ChannelId, GroupId};
use caucus_core::errors::SyncError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

/// Someone posted in a group's channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityNotification {
    pub group_id: GroupId,
    pub user_id: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `None` once the stream has closed.
    async fn next_notification(&self) -> Result<Option<ActivityNotification>, TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: ActivityNotification) -> Result<(), SyncError>;
}

/// In-process transport fed through an mpsc channel, e.g. from JSON lines
/// on stdin.
pub struct QueueTransport {
    receiver: Mutex<mpsc::Receiver<ActivityNotification>>,
}

impl QueueTransport {
    pub fn new(capacity: usize) -> (mpsc::Sender<ActivityNotification>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver: Mutex::new(receiver) })
    }
}

#[async_trait]
impl NotificationTransport for QueueTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_notification(&self) -> Result<Option<ActivityNotification>, TransportError> {
        Ok(self.receiver.lock().await.recv().await)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.receiver.lock().await.close();
        Ok(())
    }
}

pub struct RealtimeListener {
    transport: Arc<dyn NotificationTransport>,
    handler: Arc<dyn NotificationHandler>,
    reconnect_policy: ReconnectPolicy,
    local_user_id: String,
}

impl RealtimeListener {
    pub fn new(
        transport: Arc<dyn NotificationTransport>,
        handler: Arc<dyn NotificationHandler>,
        reconnect_policy: ReconnectPolicy,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self { transport, handler, reconnect_policy, local_user_id: local_user_id.into() }
    }

    /// Runs until the stream closes cleanly or retries are exhausted. Never
    /// fails: polling keeps channels fresh without push.
    pub async fn start(&self) {
        for attempt in 0..=self.reconnect_policy.max_retries {
            match self.connect_and_pump(attempt).await {
                Ok(()) => return,
                Err(transport_error) => {
                    warn!(
                        event_name = "realtime.transport.failed",
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "notification transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            event_name = "realtime.transport.exhausted",
                            max_retries = self.reconnect_policy.max_retries,
                            "notification retries exhausted; falling back to polling only"
                        );
                        return;
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn connect_and_pump(&self, attempt: u32) -> Result<(), TransportError> {
        info!(event_name = "realtime.transport.connecting", attempt, "opening notification transport");
        self.transport.connect().await?;
        info!(event_name = "realtime.transport.connected", attempt, "notification transport connected");

        loop {
            let Some(notification) = self.transport.next_notification().await? else {
                info!(attempt, "notification stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };

            if notification.user_id == self.local_user_id {
                debug!(
                    event_name = "realtime.notification.ignored",
                    group_id = %notification.group_id,
                    "ignoring notification for own activity"
                );
                continue;
            }

            let group_id = notification.group_id.clone();
            debug!(
                event_name = "realtime.notification.received",
                group_id = %group_id,
                user_id = %notification.user_id,
                "received activity notification"
            );
            if let Err(error) = self.handler.handle(notification).await {
                warn!(
                    event_name = "realtime.notification.failed",
                    group_id = %group_id,
                    error = %error,
                    "notification handling failed; continuing listener loop"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use caucus_core::domain::message::GroupId;
    use caucus_core::errors::SyncError;

    use super::{
        ActivityNotification, NotificationHandler, NotificationTransport, QueueTransport,
        RealtimeListener, ReconnectPolicy, TransportError,
    };

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        notifications: VecDeque<Result<Option<ActivityNotification>, TransportError>>,
        connect_attempts: usize,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            notifications: Vec<Result<Option<ActivityNotification>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    notifications: notifications.into(),
                    ..ScriptedState::default()
                }),
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_notification(&self) -> Result<Option<ActivityNotification>, TransportError> {
            let mut state = self.state.lock().await;
            state.notifications.pop_front().unwrap_or(Ok(None))
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.state.lock().await.disconnect_calls += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<ActivityNotification>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationHandler for RecordingHandler {
        async fn handle(&self, notification: ActivityNotification) -> Result<(), SyncError> {
            self.seen.lock().await.push(notification);
            if self.fail {
                return Err(SyncError::Slack("ratelimited".to_owned()));
            }
            Ok(())
        }
    }

    fn notification(group: &str, user: &str) -> ActivityNotification {
        ActivityNotification { group_id: GroupId(group.into()), user_id: user.into(), channel_id: None }
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(notification("g-1", "member-2"))), Ok(None)],
        ));
        let handler = Arc::new(RecordingHandler::default());

        let listener = RealtimeListener::new(
            transport.clone(),
            handler.clone(),
            ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 },
            "member-1",
        );
        listener.start().await;

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn own_notifications_are_not_forwarded() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![
                Ok(Some(notification("g-1", "member-1"))),
                Ok(Some(notification("g-2", "member-3"))),
                Ok(None),
            ],
        ));
        let handler = Arc::new(RecordingHandler::default());

        RealtimeListener::new(transport, handler.clone(), ReconnectPolicy::default(), "member-1")
            .start()
            .await;

        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].group_id, GroupId("g-2".into()));
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_loop() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![
                Ok(Some(notification("g-1", "member-2"))),
                Ok(Some(notification("g-1", "member-3"))),
                Ok(None),
            ],
        ));
        let handler = Arc::new(RecordingHandler { fail: true, ..RecordingHandler::default() });

        RealtimeListener::new(transport.clone(), handler.clone(), ReconnectPolicy::default(), "me")
            .start()
            .await;

        assert_eq!(handler.seen.lock().await.len(), 2);
        assert_eq!(transport.state.lock().await.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));

        RealtimeListener::new(
            transport.clone(),
            Arc::new(RecordingHandler::default()),
            ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 },
            "me",
        )
        .start()
        .await;

        assert_eq!(transport.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn queue_transport_ends_when_senders_drop() {
        let (sender, transport) = QueueTransport::new(4);
        sender.send(notification("g-1", "member-2")).await.expect("send");
        drop(sender);

        let handler = Arc::new(RecordingHandler::default());
        RealtimeListener::new(Arc::new(transport), handler.clone(), ReconnectPolicy::default(), "me")
            .start()
            .await;

        assert_eq!(handler.seen.lock().await.len(), 1);
    }
}
