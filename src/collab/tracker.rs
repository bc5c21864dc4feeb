use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::IssueTracker;

/// REST adapter in front of the issue tracker.
///
/// The adapter service owns tracker-specific auth and API shapes; forgeflow
/// only speaks this small JSON surface:
///
/// - `POST {base}/items/{id}/comments` → `{"id": "..."}`
/// - `PUT {base}/items/{id}/status`
/// - `POST {base}/items/{id}/labels`
/// - `PATCH {base}/items/{id}`
pub struct HttpTracker {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct CreatedComment {
    id: String,
}

impl HttpTracker {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("forgeflow")
            .build()
            .context("Failed to build tracker HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl IssueTracker for HttpTracker {
    async fn post_comment(
        &self,
        item_id: &str,
        body: &str,
        parent_comment_id: Option<&str>,
    ) -> Result<String> {
        let created: CreatedComment = self
            .authorize(
                self.client
                    .post(self.url(&format!("/items/{}/comments", item_id)))
                    .json(&json!({"body": body, "parentId": parent_comment_id})),
            )
            .send()
            .await
            .context("Failed to send comment to tracker")?
            .error_for_status()
            .context("Tracker rejected comment")?
            .json()
            .await
            .context("Failed to parse tracker comment response")?;
        Ok(created.id)
    }

    async fn update_status(&self, item_id: &str, status: &str) -> Result<()> {
        self.authorize(
            self.client
                .put(self.url(&format!("/items/{}/status", item_id)))
                .json(&json!({"status": status})),
        )
        .send()
        .await
        .context("Failed to send status update to tracker")?
        .error_for_status()
        .context("Tracker rejected status update")?;
        Ok(())
    }

    async fn add_labels(&self, item_id: &str, labels: &[String]) -> Result<()> {
        self.authorize(
            self.client
                .post(self.url(&format!("/items/{}/labels", item_id)))
                .json(&json!({"labels": labels})),
        )
        .send()
        .await
        .context("Failed to send labels to tracker")?
        .error_for_status()
        .context("Tracker rejected labels")?;
        Ok(())
    }

    async fn update_description(&self, item_id: &str, description: &str) -> Result<()> {
        self.authorize(
            self.client
                .patch(self.url(&format!("/items/{}", item_id)))
                .json(&json!({"description": description})),
        )
        .send()
        .await
        .context("Failed to send description to tracker")?
        .error_for_status()
        .context("Tracker rejected description update")?;
        Ok(())
    }
}

/// Tracker stand-in for local runs: logs every call and invents comment ids.
pub struct LogTracker;

#[async_trait]
impl IssueTracker for LogTracker {
    async fn post_comment(
        &self,
        item_id: &str,
        body: &str,
        parent_comment_id: Option<&str>,
    ) -> Result<String> {
        let id = format!("local-{}", uuid::Uuid::new_v4());
        tracing::info!(item_id, comment_id = %id, parent = ?parent_comment_id, "comment: {}", body);
        Ok(id)
    }

    async fn update_status(&self, item_id: &str, status: &str) -> Result<()> {
        tracing::info!(item_id, status, "status update");
        Ok(())
    }

    async fn add_labels(&self, item_id: &str, labels: &[String]) -> Result<()> {
        tracing::info!(item_id, ?labels, "labels");
        Ok(())
    }

    async fn update_description(&self, item_id: &str, description: &str) -> Result<()> {
        tracing::info!(item_id, chars = description.len(), "description update");
        Ok(())
    }
}
