//! Jira issue tracker: issue creation over the REST v2 API with basic auth.

use super::{IssueTracker, TrackedIssue};
use crate::config::TrackerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

pub struct JiraTracker {
    base_url: String,
    email: String,
    token: String,
    project: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

impl JiraTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            token: config.token.clone(),
            project: config.project.clone(),
            client: reqwest::Client::builder()
                .build()
                .context("failed to build HTTP client")?,
        })
    }
}

#[async_trait]
impl IssueTracker for JiraTracker {
    async fn create_issue(&self, title: &str, body: &str) -> Result<TrackedIssue> {
        let payload = serde_json::json!({
            "fields": {
                "project": { "key": self.project },
                "summary": title,
                "description": body,
                "issuetype": { "name": "Task" },
            }
        });

        let url = format!("{}/rest/api/2/issue", self.base_url);
        let created: CreatedIssue = self
            .client
            .post(&url)
            .basic_auth(&self.email, Some(&self.token))
            .json(&payload)
            .send()
            .await
            .context("failed to reach Jira")?
            .error_for_status()
            .context("Jira rejected the issue")?
            .json()
            .await
            .context("failed to decode Jira response")?;

        let url = format!("{}/browse/{}", self.base_url, created.key);
        Ok(TrackedIssue {
            key: created.key,
            url,
        })
    }
}
