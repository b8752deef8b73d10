//! Remote fetcher — `GET <service_uri>/<resource-name>`

use crate::error::{ConfigServiceError, Result};
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;

/// HTTP client for the fetch endpoint
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
    base: String,
}

impl RemoteFetcher {
    /// Create a fetcher for `service_uri`
    pub fn new(service_uri: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: service_uri.trim_end_matches('/').to_string(),
        })
    }

    /// URL of `name`, each path segment percent-encoded
    pub fn url_for(&self, name: &str) -> String {
        let path: Vec<String> = name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base, path.join("/"))
    }

    /// Content of `name`, or `None` when the endpoint reports it missing
    pub async fn fetch(&self, name: &str) -> Result<Option<Bytes>> {
        let url = self.url_for(name);
        let resp = self.client.get(&url).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes().await?)),
            status => Err(ConfigServiceError::Other(format!(
                "GET {} returned {}",
                url, status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for() {
        let fetcher = RemoteFetcher::new("http://config:8088/", Duration::from_secs(5)).unwrap();
        assert_eq!(fetcher.url_for("app.json"), "http://config:8088/app.json");
        assert_eq!(
            fetcher.url_for("env/my app.json"),
            "http://config:8088/env/my%20app.json"
        );
    }

    #[test]
    fn test_url_for_keeps_base_path() {
        let fetcher =
            RemoteFetcher::new("https://example.com/config", Duration::from_secs(5)).unwrap();
        assert_eq!(
            fetcher.url_for("a.ini"),
            "https://example.com/config/a.ini"
        );
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_error() {
        let fetcher = RemoteFetcher::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = fetcher.fetch("app.json").await.unwrap_err();
        assert!(matches!(err, ConfigServiceError::Http(_)));
    }
}
