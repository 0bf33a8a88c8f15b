use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::client::HttpClient;

/// Plain reqwest-backed client with a request timeout suited to transit
/// feed endpoints.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Self {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self(inner)
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.0.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("HTTP {status} fetching {url}");
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
