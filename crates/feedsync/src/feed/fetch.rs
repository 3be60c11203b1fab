//! Feed retrieval seam and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;

use super::{parse_feed, Product};
use crate::error::{FetchError, ParseError};
use crate::sanitize::redact_url;

/// Fetches and parses source feeds.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Downloads the raw feed body.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Turns a raw body into products.
    fn parse(&self, body: &[u8]) -> Result<Vec<Product>, ParseError> {
        parse_feed(body)
    }
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| FetchError::Request {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::MissingUrl);
        }
        let safe_url = redact_url(url);
        log::info!("Fetching feed {}", safe_url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: safe_url.clone(),
                source: source.without_url(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: safe_url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: safe_url.clone(),
                source: source.without_url(),
            })?;
        log::debug!("Fetched {} bytes from {}", body.len(), safe_url);
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let fetcher = HttpFeedFetcher::new(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            fetcher.fetch("  ").await,
            Err(FetchError::MissingUrl)
        ));
    }

    #[test]
    fn test_default_parse_uses_xml_parser() {
        let fetcher = HttpFeedFetcher::new(Duration::from_secs(1)).unwrap();
        let products = fetcher
            .parse(b"<products><product><id>1</id></product></products>")
            .unwrap();
        assert_eq!(products[0].sku, "1");
    }
}
