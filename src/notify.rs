//! Outbound operator notifications.
//!
//! Delivery is best effort: callers go through [`send_logged`], which turns
//! any failure into a warning.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::config::NotifyConfig;

/// Embed size limits enforced by the webhook; oversized embeds are rejected
/// whole.
pub const TITLE_LIMIT: usize = 256;
pub const DESCRIPTION_LIMIT: usize = 4096;
pub const FIELD_NAME_LIMIT: usize = 256;
pub const FIELD_VALUE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Embed colour as a 24-bit RGB integer.
    pub fn color(self) -> u32 {
        match self {
            Severity::Success => 0x2E_CC71,
            Severity::Info => 0x95_A5A6,
            Severity::Warning => 0xFF_FF00,
            Severity::Error => 0xE7_4C3C,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub fields: Vec<NotificationField>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(title: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            severity,
            fields: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(NotificationField {
            name: name.into(),
            value: value.into(),
            inline: true,
        });
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook rejected notification with status {0}")]
    Rejected(reqwest::StatusCode),
}

#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as a single embed to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    footer: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        footer: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            footer,
        })
    }

    fn payload(&self, notification: &Notification) -> serde_json::Value {
        let fields: Vec<_> = notification
            .fields
            .iter()
            .map(|field| {
                json!({
                    "name": truncate_chars(&field.name, FIELD_NAME_LIMIT),
                    "value": truncate_chars(&field.value, FIELD_VALUE_LIMIT),
                    "inline": field.inline,
                })
            })
            .collect();
        let mut embed = json!({
            "title": truncate_chars(&notification.title, TITLE_LIMIT),
            "description": truncate_chars(&notification.description, DESCRIPTION_LIMIT),
            "color": notification.severity.color(),
            "fields": fields,
            "timestamp": notification.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        if let Some(footer) = &self.footer {
            embed["footer"] = json!({ "text": footer });
        }
        json!({ "embeds": [embed] })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(notification))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::debug!(title = %notification.title, "notifications disabled; dropping");
        Ok(())
    }
}

pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    let Some(url) = config.webhook_url.as_deref().filter(|url| !url.is_empty()) else {
        return Arc::new(DisabledNotifier);
    };
    match WebhookNotifier::new(url, config.footer.clone(), config.timeout) {
        Ok(notifier) => Arc::new(notifier),
        Err(error) => {
            tracing::warn!(%error, "could not build webhook client; notifications disabled");
            Arc::new(DisabledNotifier)
        }
    }
}

pub async fn send_logged(notifier: &dyn Notifier, notification: Notification) {
    match notifier.notify(&notification).await {
        Ok(()) => tracing::debug!(title = %notification.title, "notification sent"),
        Err(error) => {
            tracing::warn!(%error, title = %notification.title, "failed to send notification")
        }
    }
}

/// Clips `text` to `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut clipped: String = text.chars().take(keep).collect();
    clipped.push_str("...");
    clipped
}
