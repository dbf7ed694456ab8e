//! Direct query of the home peer's info endpoint, used to seed the registry
//! before the first dial.

use burrow_protocol::{InfoResponse, P2pInfo};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("info endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

pub struct DirectQuery {
    client: reqwest::Client,
    url: String,
}

impl DirectQuery {
    pub fn new(api_root: &str, timeout: Duration) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/info/p2p", api_root.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> Result<P2pInfo, QueryError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(QueryError::Status(response.status()));
        }
        let body: InfoResponse = response.json().await?;
        Ok(body.info)
    }
}

/// Ask the home peer for its addresses. Failures are logged and yield `None`,
/// leaving the registry to its cache.
pub async fn query_info(api_root: Option<&str>, timeout: Duration) -> Option<P2pInfo> {
    let root = api_root?;
    let query = match DirectQuery::new(root, timeout) {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(%root, "registry: cannot build direct query: {e}");
            return None;
        }
    };
    match query.fetch().await {
        Ok(info) => {
            tracing::info!(
                local = ?info.local_multiaddr,
                public = ?info.public_multiaddr,
                "registry: direct query answered"
            );
            Some(info)
        }
        Err(e) => {
            tracing::warn!(url = %query.url(), "registry: direct query failed, using cache: {e}");
            None
        }
    }
}
