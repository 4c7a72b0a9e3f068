//! Slack notifier: a single webhook POST per message.

use super::Notifier;
use anyhow::{Context, Result};
use async_trait::async_trait;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let payload = serde_json::json!({ "text": message });
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("failed to send Slack webhook")?
            .error_for_status()
            .context("Slack webhook rejected the message")?;
        Ok(())
    }
}
