//! Telegram Bot API notifier.

use super::Notifier;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, warn};

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: SecretString,
    chat_id: String,
}

/// Escape text for `parse_mode=HTML`
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

impl TelegramNotifier {
    pub fn new(
        api_base: &str,
        token: SecretString,
        chat_id: &str,
        timeout_secs: u64,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            chat_id: chat_id.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token.expose_secret())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str, is_error: bool) {
        let icon = if is_error { "❌" } else { "✅" };
        let text = format!("{} {}", icon, escape_html(message));
        let form = [
            ("chat_id", self.chat_id.as_str()),
            ("text", text.as_str()),
            ("parse_mode", "HTML"),
        ];

        // The URL embeds the token; errors are reported without it.
        match self.client.post(self.endpoint()).form(&form).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered");
            }
            Ok(response) => {
                warn!("Notification rejected with HTTP {}", response.status());
            }
            Err(e) => {
                warn!("Notification failed: {}", e.without_url());
            }
        }
    }
}
