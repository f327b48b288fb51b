use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::pipeline::fs_adapters::Publisher;
use crate::storage::pointer::LastGoodPointer;

/// Posts the committed pointer as JSON to a webhook.
pub struct WebhookPublisher {
    url: String,
    timeout: Duration,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, pointer: &LastGoodPointer) -> Result<String> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client.post(&self.url).json(pointer).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Publish webhook returned status {} for '{}': {}",
                status.as_u16(),
                self.url,
                body
            );
        }

        info!(url = %self.url, status = status.as_u16(), "Pointer published");
        Ok(format!("published to {} ({})", self.url, status.as_u16()))
    }
}
