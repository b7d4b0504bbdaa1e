use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::payloads::{GetUpdatesSetters, SendMessageSetters, SetWebhookSetters};
use teloxide::prelude::*;
use teloxide::types::{
    KeyboardButton, KeyboardMarkup, KeyboardRemove, ReplyMarkup, Update as TgUpdate, UpdateKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Markup, OutboundAction, Transport};
use crate::config::TelegramConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::update::{Payload, SessionId, Update};

/// Telegram rejects messages over 4096 chars
const MAX_MESSAGE_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Bot API client whose HTTP timeout leaves room for long polling
pub fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(u64::from(config.poll_timeout_secs) + 10))
        .build()
        .context("Failed to build HTTP client")?;
    Ok(Bot::with_client(config.bot_token.clone(), client))
}

/// Convert a Telegram update into a dispatcher update.
/// Updates that are not tied to a chat are skipped.
pub fn convert(update: &TgUpdate) -> Option<Update> {
    let chat = update.chat()?;

    let payload = match &update.kind {
        UpdateKind::Message(message) => match message.text() {
            Some(text) => Payload::from_text(text),
            None => Payload::Event {
                kind: "message".to_string(),
            },
        },
        UpdateKind::EditedMessage(_) => Payload::Event {
            kind: "edited_message".to_string(),
        },
        UpdateKind::CallbackQuery(query) => Payload::Callback {
            data: query.data.clone().unwrap_or_default(),
        },
        UpdateKind::MyChatMember(_) => Payload::Event {
            kind: "my_chat_member".to_string(),
        },
        _ => return None,
    };

    Some(Update::new(u64::from(update.id.0), chat.id.0, payload))
}

/// Decode a Telegram webhook body. `Ok(None)` for updates without a chat.
pub fn decode(raw: &[u8]) -> Result<Option<Update>, DispatchError> {
    let update: TgUpdate = serde_json::from_slice(raw).map_err(DispatchError::malformed)?;
    let converted = convert(&update);
    if converted.is_none() {
        debug!("Ignoring update {} without a chat", update.id.0);
    }
    Ok(converted)
}

fn reply_markup(markup: &Markup) -> ReplyMarkup {
    match markup {
        Markup::Keyboard(rows) => ReplyMarkup::Keyboard(KeyboardMarkup::new(
            rows.iter()
                .map(|row| row.iter().map(KeyboardButton::new).collect::<Vec<_>>()),
        )),
        Markup::RemoveKeyboard => ReplyMarkup::KeyboardRemove(KeyboardRemove::new()),
    }
}

/// Sends replies through the Bot API
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn chat_id(session: &SessionId) -> Result<ChatId> {
    let id = session
        .as_str()
        .parse::<i64>()
        .with_context(|| format!("Session '{}' is not a Telegram chat id", session))?;
    Ok(ChatId(id))
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, action: &OutboundAction) -> Result<()> {
        let chat_id = chat_id(&action.session)?;
        let chunks = split_message(&action.text, MAX_MESSAGE_LEN);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut request = self.bot.send_message(chat_id, chunk);
            if i == last {
                if let Some(markup) = &action.markup {
                    request = request.reply_markup(reply_markup(markup));
                }
            }
            request.await.context("sendMessage failed")?;
        }

        Ok(())
    }
}

/// Point Telegram at our webhook endpoint
pub async fn register_webhook(bot: &Bot, url: &str, secret: Option<&str>) -> Result<()> {
    let url = reqwest::Url::parse(url).with_context(|| format!("Invalid webhook URL: {}", url))?;
    let mut request = bot.set_webhook(url.clone());
    if let Some(secret) = secret {
        request = request.secret_token(secret.to_string());
    }
    request.await.context("setWebhook failed")?;
    info!("Webhook registered at {}", url);
    Ok(())
}

/// Delay before the next getUpdates after `failures` consecutive errors
fn poll_backoff(failures: u32) -> Duration {
    let secs = 2u64.saturating_pow(failures.min(5));
    Duration::from_secs(secs.min(30))
}

/// Long-poll getUpdates and feed the dispatcher until `shutdown` fires.
pub async fn run_polling(
    bot: Bot,
    dispatcher: Arc<Dispatcher>,
    poll_timeout_secs: u32,
    shutdown: CancellationToken,
) -> Result<()> {
    // getUpdates is refused while a webhook is set
    if let Err(e) = bot.delete_webhook().await {
        warn!("Failed to delete webhook before polling: {}", e);
    }

    info!("Polling for updates (timeout {}s)", poll_timeout_secs);

    let mut offset: i32 = 0;
    let mut failures: u32 = 0;

    loop {
        let request = bot
            .get_updates()
            .offset(offset)
            .timeout(poll_timeout_secs);

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = request.send() => result,
        };

        match result {
            Ok(updates) => {
                failures = 0;
                for raw in updates {
                    offset = (raw.id.0 as i32).saturating_add(1);
                    let Some(update) = convert(&raw) else {
                        debug!("Ignoring update {} without a chat", raw.id.0);
                        continue;
                    };
                    match dispatcher.handle_update(update).await {
                        Ok(_) => {}
                        Err(DispatchError::ShuttingDown) => {
                            info!("Polling stopped: dispatcher shutting down");
                            return Ok(());
                        }
                        Err(e) => warn!("Dropping update {}: {}", raw.id.0, e),
                    }
                }
            }
            Err(e) => {
                failures += 1;
                let delay = poll_backoff(failures);
                warn!(
                    "getUpdates failed ({} in a row): {}; retrying in {:?}",
                    failures, e, delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("Polling stopped");
    Ok(())
}
