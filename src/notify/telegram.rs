//! Telegram Bot API notifier (HTML parse mode).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::TelegramConfig;
use crate::notify::{Notifier, NotifyError};

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    chat_id: String,
    configured: bool,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let api_base = format!(
            "{}/bot{}",
            config.api_url.trim_end_matches('/'),
            config.bot_token
        );
        Ok(Self {
            client,
            api_base,
            chat_id: config.chat_id.clone(),
            configured: config.is_configured(),
        })
    }

    async fn decode(resp: reqwest::Response) -> Result<ApiResponse, NotifyError> {
        let status = resp.status();
        let body: ApiResponse = resp.json().await.map_err(|e| NotifyError::Api {
            status: status.as_u16(),
            description: format!("unreadable response: {e}"),
        })?;
        if !status.is_success() || !body.ok {
            return Err(NotifyError::Api {
                status: status.as_u16(),
                description: body.description.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        if !self.configured {
            let preview: String = text.chars().take(200).collect();
            info!(message = %preview, "Telegram not configured, would send");
            return Ok(());
        }

        let resp = self
            .client
            .post(format!("{}/sendMessage", self.api_base))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Self::decode(resp).await?;
        debug!("Telegram message sent");
        Ok(())
    }

    async fn probe(&self) -> Result<String, NotifyError> {
        if !self.configured {
            return Ok("telegram (not configured, log only)".to_string());
        }
        let resp = self
            .client
            .get(format!("{}/getMe", self.api_base))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let body = Self::decode(resp).await?;
        let username = body
            .result
            .as_ref()
            .and_then(|r| r.get("username"))
            .and_then(|u| u.as_str())
            .unwrap_or("unknown");
        Ok(format!("telegram @{username}"))
    }

    fn name(&self) -> &str {
        "telegram"
    }
}
