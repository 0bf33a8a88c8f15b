use anyhow::Result;
use async_trait::async_trait;

/// Byte-level HTTP fetch. The realtime cache and downloader are generic over
/// this so tests can serve canned feed bytes without a network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}
