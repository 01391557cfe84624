use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::json;

use crate::config::Config;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator chat channel reached through a bot HTTP API.
#[derive(Clone)]
pub struct ChatNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl ChatNotifier {
    pub fn new(api_base: String, bot_token: String, chat_id: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .context("failed to build alert HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
        })
    }

    /// `None` when the bot token or chat id is missing.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        match (&config.alert_bot_token, &config.alert_chat_id) {
            (Some(token), Some(chat_id)) => Ok(Some(Self::new(
                config.alert_api_base.clone(),
                token.clone(),
                chat_id.clone(),
            )?)),
            _ => Ok(None),
        }
    }

    pub async fn send(&self, text: &str, parse_mode: &str) -> anyhow::Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": parse_mode,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            // The URL embeds the bot token.
            .map_err(|error| error.without_url())
            .context("failed to reach alert channel")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "alert channel rejected message with status {}: {}",
                status,
                body
            ));
        }

        Ok(())
    }
}
