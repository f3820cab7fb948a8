//! Best-effort push notifications.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Writes notifications to the log. Used when no push channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        info!(notification = text, "notification");
        Ok(())
    }
}

pub const TELEGRAM_API: &str = "https://api.telegram.org";

/// Sends notifications through a Telegram bot.
#[derive(Clone)]
pub struct TelegramNotifier {
    base_url: String,
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            token: token.into(),
            chat_id: chat_id.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.base_url.trim_end_matches('/'),
            self.token
        );
        let resp = self
            .client
            .post(url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .context("telegram POST failed")?;
        let status = resp.status();
        let body = resp.text().await.context("telegram read failed")?;
        let parsed: TelegramResponse = serde_json::from_str(&body)
            .with_context(|| format!("telegram response parse failed: HTTP {status}"))?;
        if !parsed.ok {
            bail!(
                "telegram error: HTTP {status}: {}",
                parsed.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}
