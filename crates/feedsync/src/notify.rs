//! Webhook delivery.
//!
//! Delivery is best-effort: failures are logged and never reach the job
//! that triggered them.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{format_timestamp, webhook_repo, Database};
use crate::sanitize::redact_url;

pub const EVENT_SYNC_COMPLETED: &str = "sync_completed";
pub const EVENT_CATEGORIZATION_COMPLETED: &str = "categorization_completed";

/// A user's webhook subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn new(user_id: impl Into<String>, url: impl Into<String>, events: Vec<String>) -> Self {
        let url = url.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: redact_url(&url),
            url,
            headers: BTreeMap::new(),
            events,
            is_active: true,
            created_at: Utc::now(),
            last_triggered_at: None,
        }
    }
}

/// Payload posted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub items_processed: u64,
    pub items_failed: u64,
}

#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    /// Delivers `event` to the user's subscribed webhooks.
    async fn notify(&self, user_id: &str, event: &WebhookEvent);
}

/// Notifier that drops every event.
pub struct NoopNotifier;

#[async_trait]
impl WebhookNotifier for NoopNotifier {
    async fn notify(&self, _user_id: &str, _event: &WebhookEvent) {}
}

/// Posts events as JSON to the subscriptions stored in the database.
pub struct HttpWebhookNotifier {
    db: Database,
    client: reqwest::Client,
}

impl HttpWebhookNotifier {
    pub fn new(db: Database, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { db, client })
    }

    async fn deliver(&self, webhook: &Webhook, body: &str) -> Result<(), String> {
        let mut request = self
            .client
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        for (name, value) in &webhook.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookNotifier for HttpWebhookNotifier {
    async fn notify(&self, user_id: &str, event: &WebhookEvent) {
        let webhooks = match webhook_repo::list_subscribed(&self.db, user_id, &event.event) {
            Ok(webhooks) => webhooks,
            Err(e) => {
                log::error!("Failed to load webhooks for user {}: {}", user_id, e);
                return;
            }
        };
        if webhooks.is_empty() {
            return;
        }

        let body = match serde_json::to_string(event) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to encode webhook payload: {}", e);
                return;
            }
        };

        for webhook in &webhooks {
            match self.deliver(webhook, &body).await {
                Ok(()) => {
                    log::info!("Delivered {} to {}", event.event, redact_url(&webhook.url));
                    if let Err(e) = webhook_repo::mark_triggered(
                        &self.db,
                        &webhook.id,
                        &format_timestamp(Utc::now()),
                        &body,
                    ) {
                        log::warn!("Failed to record webhook delivery {}: {}", webhook.id, e);
                    }
                }
                Err(e) => log::warn!(
                    "Webhook {} ({}) failed for {}: {}",
                    webhook.id,
                    redact_url(&webhook.url),
                    event.event,
                    e
                ),
            }
        }
    }
}
