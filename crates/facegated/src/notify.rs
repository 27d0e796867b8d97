//! Best-effort notifications of access events.
//!
//! Notifications never affect the decision path: `notify` returns
//! immediately, and delivery failures are logged and dropped.

use crate::config::NotifyConfig;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum AccessEvent {
    Registered { name: String },
    Authorized {
        name: String,
        score: f32,
        action: Option<String>,
    },
    Denied {
        score: Option<f32>,
        action: Option<String>,
    },
    NoFace { action: Option<String> },
}

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            AccessEvent::Registered { name } => return write!(f, "New face registered: {name}"),
            AccessEvent::Authorized { name, score, action } => {
                write!(f, "Access granted: {name} ({score:.2})")?;
                action
            }
            AccessEvent::Denied { score, action } => {
                match score {
                    Some(score) => write!(f, "Access denied ({score:.2})")?,
                    None => f.write_str("Access denied")?,
                }
                action
            }
            AccessEvent::NoFace { action } => {
                f.write_str("No face detected")?;
                action
            }
        };
        match action {
            Some(action) => write!(f, " [{action}]"),
            None => Ok(()),
        }
    }
}

/// Sink for access events.
pub trait Notifier: Send + Sync {
    /// Hand off an event. Must not block on delivery and must not fail.
    fn notify(&self, event: &AccessEvent);
}

/// Used when no notification channel is configured.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, event: &AccessEvent) {
        tracing::debug!(%event, "notification channel not configured");
    }
}

/// Sends events as Telegram bot messages.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: SecretString, chat_id: String) -> Self {
        Self::with_api_base(TELEGRAM_API, token, chat_id)
    }

    pub fn with_api_base(api_base: &str, token: SecretString, chat_id: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("facegated/{}", env!("CARGO_PKG_VERSION")))
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            chat_id,
        }
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: &AccessEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%event, "no async runtime, notification dropped");
            return;
        };

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token.expose_secret());
        let request = self.client.post(url).json(&serde_json::json!({
            "chat_id": self.chat_id,
            "text": event.to_string(),
        }));

        runtime.spawn(async move {
            // reqwest errors may embed the URL, which carries the token.
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("notification delivered");
                }
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "notification rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e.without_url(), "notification failed");
                }
            }
        });
    }
}

/// Telegram when both credentials are configured, otherwise a no-op.
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match telegram_credentials(config) {
        Some((token, chat_id)) => {
            tracing::info!("telegram notifications enabled");
            Arc::new(TelegramNotifier::new(token.clone(), chat_id.to_string()))
        }
        None => Arc::new(NoopNotifier),
    }
}

fn telegram_credentials(config: &NotifyConfig) -> Option<(&SecretString, &str)> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Some((token, chat_id.as_str())),
        (None, None) => {
            tracing::info!("notifications disabled");
            None
        }
        _ => {
            tracing::warn!("telegram token and chat id must both be set; notifications disabled");
            None
        }
    }
}
