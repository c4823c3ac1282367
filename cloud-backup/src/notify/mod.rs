//! Outcome notifications.
//!
//! Delivery is best-effort: a notifier never returns an error and never
//! blocks a run for longer than its configured timeout.

pub mod message;
pub mod telegram;

use crate::config::NotifyConfig;
use async_trait::async_trait;
use tracing::{debug, warn};

pub use telegram::TelegramNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, is_error: bool);
}

/// Used when no credentials are configured
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, _message: &str, is_error: bool) {
        debug!("Notifications disabled, dropping {} message", if is_error { "failure" } else { "success" });
    }
}

/// Build the notifier for `config`, falling back to [`DisabledNotifier`]
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    let Some((token, chat_id)) = config.credentials() else {
        return Box::new(DisabledNotifier);
    };
    match TelegramNotifier::new(&config.api_base, token.clone(), chat_id, config.timeout_secs) {
        Ok(notifier) => Box::new(notifier),
        Err(e) => {
            warn!("Notifications disabled, could not build HTTP client: {}", e);
            Box::new(DisabledNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[tokio::test]
    async fn test_missing_credentials_disable_notifier() {
        let notifier = from_config(&NotifyConfig::default());
        // Must return promptly and silently
        notifier.notify("hello", false).await;

        let partial = NotifyConfig {
            bot_token: Some(SecretString::from("123:abc".to_string())),
            ..NotifyConfig::default()
        };
        assert!(partial.credentials().is_none());
    }
}
