//! Notification sink for newly placed media
//!
//! Best effort only: callers log failures and move on. Nothing here is
//! retried, and the worker never waits on delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use super::filename_parser::MediaKind;
use crate::config::Config;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, kind: MediaKind, details: &str) -> Result<()>;
}

/// Human label for a media kind
fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Tv => "TV Show",
        MediaKind::Movie => "Movie",
    }
}

/// Message body sent for a placement
pub fn format_message(title: &str, kind: MediaKind, details: &str) -> String {
    let mut message = format!("🎬 {} Added\n\n{}", kind_label(kind), title);
    if !details.is_empty() {
        message.push('\n');
        message.push_str(details);
    }
    message
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, title: &str, kind: MediaKind, _details: &str) -> Result<()> {
        debug!(title = %title, kind = %kind, "Notifications disabled");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API client
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent("medialink/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: TELEGRAM_API.to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    /// Point at a different API host
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, title: &str, kind: MediaKind, details: &str) -> Result<()> {
        let text = format_message(title, kind, details);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
        };

        self.client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .context("Failed to reach Telegram")?
            .error_for_status()
            .context("Telegram rejected the message")?;

        debug!(title = %title, kind = %kind, "Sent Telegram notification");
        Ok(())
    }
}

/// Pick the notifier for this run.
///
/// Telegram only when enabled, fully configured and not a dry run.
pub fn from_config(config: &Config) -> Arc<dyn Notifier> {
    if config.dry_run || !config.enable_telegram {
        return Arc::new(NoopNotifier);
    }

    let Some((token, chat_id)) = config.telegram_credentials() else {
        warn!("ENABLE_TELEGRAM is set but TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID is missing");
        return Arc::new(NoopNotifier);
    };

    match TelegramNotifier::new(token, chat_id) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!(error = %e, "Telegram notifier unavailable, notifications disabled");
            Arc::new(NoopNotifier)
        }
    }
}

/// Fire and forget. Failures are logged at warn.
pub fn spawn_notification(
    notifier: Arc<dyn Notifier>,
    title: String,
    kind: MediaKind,
    details: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&title, kind, &details).await {
            warn!(title = %title, kind = %kind, error = %e, "Notification failed");
        }
    })
}
