//! Best-effort deletion of consumed schedule records on the dashboard
//! backend, addressed by their correlation key.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::config::RemoteConfig;

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("key {0:?} contains characters not allowed in a URL path segment")]
    InvalidKey(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote answered {0}")]
    Status(StatusCode),
}

/// Deletes the remote record behind a correlation key.
pub trait RemoteDelete {
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), DeleteError>>;
}

pub struct HttpDeleter {
    client: Client,
    url_template: String,
    api_key: Option<(String, String)>,
}

impl HttpDeleter {
    pub fn new(cfg: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url_template: cfg.delete_url.clone(),
            api_key: cfg
                .api_key
                .clone()
                .map(|key| (cfg.api_key_header.clone(), key)),
        })
    }

    fn url_for(&self, key: &str) -> Result<String, DeleteError> {
        let safe = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !safe || key == "." || key == ".." {
            return Err(DeleteError::InvalidKey(key.to_string()));
        }
        Ok(self.url_template.replace("{key}", key))
    }
}

impl RemoteDelete for HttpDeleter {
    async fn delete(&self, key: &str) -> Result<(), DeleteError> {
        let url = self.url_for(key)?;
        let mut request = self.client.delete(&url);
        if let Some((header, value)) = &self.api_key {
            request = request.header(header.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeleteError::Status(status));
        }
        tracing::debug!(%url, %status, "remote record deleted");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
