use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use caucus_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct ConfigField {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<ConfigField> {
    let field = |key, env_keys, value: String| ConfigField { key, env_keys, value };

    vec![
        field("database.url", &["CAUCUS_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["CAUCUS_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["CAUCUS_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field(
            "slack.bot_token",
            &["CAUCUS_SLACK_BOT_TOKEN"],
            redact_token(config.slack.bot_token.expose_secret()),
        ),
        field("slack.api_base_url", &["CAUCUS_SLACK_API_BASE_URL"], config.slack.api_base_url.clone()),
        field(
            "slack.bot_display_name",
            &["CAUCUS_SLACK_BOT_DISPLAY_NAME"],
            config.slack.bot_display_name.clone(),
        ),
        field("slack.timeout_secs", &["CAUCUS_SLACK_TIMEOUT_SECS"], config.slack.timeout_secs.to_string()),
        field(
            "sync.active_poll_secs",
            &["CAUCUS_SYNC_ACTIVE_POLL_SECS"],
            config.sync.active_poll_secs.to_string(),
        ),
        field(
            "sync.background_poll_secs",
            &["CAUCUS_SYNC_BACKGROUND_POLL_SECS"],
            config.sync.background_poll_secs.to_string(),
        ),
        field(
            "sync.page_size",
            &["CAUCUS_SYNC_PAGE_SIZE"],
            config.sync.page_size.to_string(),
        ),
        field(
            "sync.short_page_size",
            &["CAUCUS_SYNC_SHORT_PAGE_SIZE"],
            config.sync.short_page_size.to_string(),
        ),
        field(
            "sync.scroll_threshold_px",
            &["CAUCUS_SYNC_SCROLL_THRESHOLD_PX"],
            config.sync.scroll_threshold_px.to_string(),
        ),
        field(
            "sync.history_cooldown_ms",
            &["CAUCUS_SYNC_HISTORY_COOLDOWN_MS"],
            config.sync.history_cooldown_ms.to_string(),
        ),
        field(
            "sync.post_send_delay_ms",
            &["CAUCUS_SYNC_POST_SEND_DELAY_MS"],
            config.sync.post_send_delay_ms.to_string(),
        ),
        field(
            "sync.failed_send_ttl_secs",
            &["CAUCUS_SYNC_FAILED_SEND_TTL_SECS"],
            config.sync.failed_send_ttl_secs.to_string(),
        ),
        field(
            "server.bind_address",
            &["CAUCUS_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        field("server.port", &["CAUCUS_SERVER_PORT"], config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            &["CAUCUS_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field(
            "logging.level",
            &["CAUCUS_LOGGING_LEVEL", "CAUCUS_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["CAUCUS_LOGGING_FORMAT", "CAUCUS_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("caucus.toml"), PathBuf::from("config/caucus.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
