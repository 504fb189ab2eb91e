use std::sync::Arc;
use std::time::Duration;

use caucus_core::clock::{Clock, SystemClock};
use caucus_core::config::AppConfig;
use caucus_core::domain::message::{ChannelId, ChannelMessage, GroupId, MemberRef, SlackTimestamp};
use caucus_core::signature;
use caucus_db::repositories::{
    CachedMessages, GroupChannelRepository, MessageCacheRepository, SqlGroupChannelRepository,
    SqlMessageCacheRepository, SqlPreferenceRepository, SqlReadStateRepository,
};
use caucus_db::DbPool;
use caucus_slack::realtime::{
    ActivityNotification, QueueTransport, RealtimeListener, ReconnectPolicy,
};
use caucus_slack::{
    ChannelSynchronizer, SeedChannel, SyncEvent, SyncStores, SynchronizerSettings, Viewer,
};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};

use crate::commands::{connect_slack, execute, open_database, CommandFailure, CommandResult, Exit};

const TAIL_VIEWER_ID: &str = "caucus-cli";
const NOTIFICATION_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct TailArgs {
    pub channel: String,
    pub group: Option<String>,
    pub duration_secs: Option<u64>,
    pub notify_stdin: bool,
}

/// Prints each confirmed message once, in timestamp order.
#[derive(Debug, Default)]
pub struct MessagePrinter {
    last_printed: Option<SlackTimestamp>,
}

impl MessagePrinter {
    pub fn take(&mut self, messages: &[ChannelMessage]) -> Vec<String> {
        let mut lines = Vec::new();
        for message in messages {
            if message.is_placeholder() {
                continue;
            }
            if self.last_printed.as_ref().is_some_and(|last| message.ts <= *last) {
                continue;
            }
            lines.push(render_message(message));
            self.last_printed = Some(message.ts.clone());
        }
        lines
    }
}

fn render_message(message: &ChannelMessage) -> String {
    let author = message
        .author()
        .map(MemberRef::display_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| message.user.to_string());
    let mut line =
        format!("{}  {}: {}", message.ts, author, signature::strip_signature(&message.text));
    for file in &message.files {
        line.push_str(&format!(" [file: {}]", file.name));
    }
    line
}

pub fn run(args: TailArgs) -> CommandResult {
    let channel = args.channel.clone();
    execute(
        "tail",
        |config| async move {
            let pool = open_database(&config).await?;
            let result = follow(&config, &args, &pool).await;
            pool.close().await;
            result
        },
        |printed| {
            CommandResult::success(
                "tail",
                format!("followed {channel} and printed {printed} messages"),
            )
        },
    )
}

fn sync_failure(error: impl ToString) -> CommandFailure {
    CommandFailure::new("sync", error.to_string(), Exit::Runtime)
}

async fn follow(
    config: &AppConfig,
    args: &TailArgs,
    pool: &DbPool,
) -> Result<usize, CommandFailure> {
    let (api, identity) = connect_slack(config).await?;

    let channel_id = ChannelId(args.channel.clone());
    let groups = SqlGroupChannelRepository::new(pool.clone());
    let known_group = groups.find_by_channel(&channel_id).await.ok().flatten();
    let group_id = match (&args.group, &known_group) {
        (Some(group), _) => GroupId(group.clone()),
        (None, Some(group)) => group.group_id.clone(),
        (None, None) => GroupId(args.channel.clone()),
    };
    let members: Vec<MemberRef> = match groups.members(&group_id).await {
        Ok(members) => members.iter().filter_map(|member| member.as_member_ref()).collect(),
        Err(_) => Vec::new(),
    };
    let cache = SqlMessageCacheRepository::new(pool.clone());
    let cached = cached_messages(&cache, &channel_id).await;

    let stores = SyncStores {
        read_state: Arc::new(SqlReadStateRepository::new(pool.clone())),
        preferences: Arc::new(SqlPreferenceRepository::new(pool.clone())),
    };
    let synchronizer = Arc::new(
        ChannelSynchronizer::open(
            api,
            stores,
            Arc::new(SystemClock),
            Viewer { user_id: TAIL_VIEWER_ID.to_string(), member: None },
            identity.user_id,
            SynchronizerSettings::from(&config.sync),
        )
        .await
        .map_err(sync_failure)?,
    );

    let mut events = synchronizer.subscribe();
    synchronizer
        .seed(vec![SeedChannel {
            group_id: group_id.clone(),
            channel_id: Some(channel_id.clone()),
            messages: cached,
            members,
        }])
        .await
        .map_err(sync_failure)?;
    synchronizer.select_channel(&group_id).await.map_err(sync_failure)?;

    let mut printer = MessagePrinter::default();
    let mut printed = print_snapshot(&synchronizer, &group_id, &mut printer).await;
    synchronizer
        .refresh_active()
        .await
        .map_err(|error| CommandFailure::slack("slack", error))?;
    printed += print_snapshot(&synchronizer, &group_id, &mut printer).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut driver_stop = stop_rx.clone();
    let driver = synchronizer.run(async move {
        let _ = driver_stop.changed().await;
    });

    let notifications = async {
        if !args.notify_stdin {
            return;
        }
        let (sender, transport) = QueueTransport::new(NOTIFICATION_QUEUE);
        let listener = RealtimeListener::new(
            Arc::new(transport),
            synchronizer.clone(),
            ReconnectPolicy::default(),
            TAIL_VIEWER_ID,
        );
        let mut stop = stop_rx.clone();
        tokio::select! {
            _ = stop.changed() => {}
            _ = async {
                tokio::join!(
                    listener.start(),
                    forward_notifications(BufReader::new(tokio::io::stdin()), sender),
                )
            } => {}
        }
    };

    let follower = async {
        let stop = stop_signal(args.duration_secs);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = events.recv() => match event {
                    Ok(SyncEvent::Updated { group_id: updated, .. }) if updated == group_id => {
                        printed += print_snapshot(&synchronizer, &group_id, &mut printer).await;
                    }
                    Ok(SyncEvent::NewMessageToast { user_id, .. }) => {
                        eprintln!("new activity from {user_id}");
                    }
                    Ok(SyncEvent::SendFailed { error, .. }) => eprintln!("send failed: {error}"),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        printed += print_snapshot(&synchronizer, &group_id, &mut printer).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        let _ = stop_tx.send(true);
    };

    tokio::join!(driver, notifications, follower);

    if let Some(snapshot) = synchronizer.snapshot(&group_id).await {
        remember_messages(&cache, &channel_id, &snapshot.state.messages, SystemClock.now()).await;
    }
    Ok(printed)
}

/// Last cached page for `channel`, shown before the first refresh lands.
async fn cached_messages(
    cache: &dyn MessageCacheRepository,
    channel: &ChannelId,
) -> Vec<ChannelMessage> {
    match cache.load(channel).await {
        Ok(Some(cached)) => cached.messages,
        Ok(None) => Vec::new(),
        Err(error) => {
            eprintln!("ignoring message cache for {channel}: {error}");
            Vec::new()
        }
    }
}

/// Writes the confirmed messages back so the next run starts warm.
async fn remember_messages(
    cache: &dyn MessageCacheRepository,
    channel: &ChannelId,
    messages: &[ChannelMessage],
    now: DateTime<Utc>,
) {
    let confirmed: Vec<ChannelMessage> =
        messages.iter().filter(|message| !message.is_placeholder()).cloned().collect();
    if confirmed.is_empty() {
        return;
    }
    let cached =
        CachedMessages { channel_id: channel.clone(), messages: confirmed, refreshed_at: now };
    if let Err(error) = cache.store(cached).await {
        eprintln!("could not cache messages for {channel}: {error}");
    }
}

/// Feeds JSON-line notifications into the listener queue. Lines that do not
/// parse are reported and skipped. Returns how many were forwarded.
pub async fn forward_notifications<R>(
    reader: R,
    sender: mpsc::Sender<ActivityNotification>,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                eprintln!("notification input closed: {error}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ActivityNotification>(line) {
            Ok(notification) => {
                if sender.send(notification).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Err(error) => eprintln!("ignoring notification line: {error}"),
        }
    }
    forwarded
}

async fn print_snapshot(
    synchronizer: &ChannelSynchronizer,
    group_id: &GroupId,
    printer: &mut MessagePrinter,
) -> usize {
    let Some(snapshot) = synchronizer.snapshot(group_id).await else {
        return 0;
    };
    let lines = printer.take(&snapshot.state.messages);
    for line in &lines {
        println!("{line}");
    }
    lines.len()
}

async fn stop_signal(duration_secs: Option<u64>) {
    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = deadline => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
