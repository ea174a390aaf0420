//! Upstream markets API client.
//!
//! [`PageSource`] is the seam the collector pages through; [`MarketsClient`]
//! is the reqwest implementation against `GET {base}/coins/markets`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::FetchError;

/// Public API root.
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Largest page size the endpoint serves.
pub const DEFAULT_PER_PAGE: u32 = 250;

/// Default request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const MARKETS_PATH: &str = "coins/markets";

/// Source of ranked record pages (1-indexed).
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches one page as raw records.
    async fn fetch_page(&self, page: u32) -> Result<Vec<Value>, FetchError>;

    /// Records per full page; a shorter page is the last one.
    fn page_size(&self) -> u32;
}

/// Settings for [`MarketsClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root; `/coins/markets` is joined onto it.
    pub base_url: String,
    /// Sent as `x_cg_demo_api_key` when present.
    pub api_key: Option<String>,
    /// Records per page. A shorter page ends collection.
    pub per_page: u32,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            per_page: DEFAULT_PER_PAGE,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// reqwest-backed [`PageSource`] for the markets endpoint.
#[derive(Debug, Clone)]
pub struct MarketsClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    per_page: u32,
}

impl MarketsClient {
    /// Builds the client and resolves the endpoint URL.
    ///
    /// # Errors
    ///
    /// [`FetchError::InvalidUrl`] when `base_url` does not parse, and
    /// [`FetchError::Network`] if the HTTP client cannot be constructed.
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let endpoint = markets_endpoint(&config.base_url)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| FetchError::network(endpoint.as_str(), e))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            per_page: config.per_page.max(1),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn query(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", self.per_page.to_string()),
            ("page", page.to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("x_cg_demo_api_key", key.clone()));
        }
        params
    }
}

#[async_trait]
impl PageSource for MarketsClient {
    // The key travels as a query parameter, so only the bare endpoint is
    // recorded in errors and spans.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch_page(&self, page: u32) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}?page={page}", self.endpoint);

        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&self.query(page))
            .send()
            .await
            .map_err(|e| FetchError::network(&url, e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            debug!(status = status.as_u16(), "non-success response");
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::decode(&url, e.without_url().to_string()))?;

        match body {
            Value::Array(records) => {
                debug!(records = records.len(), "page fetched");
                Ok(records)
            }
            other => Err(FetchError::decode(
                url,
                format!("expected a JSON array, got {}", json_kind(&other)),
            )),
        }
    }

    fn page_size(&self) -> u32 {
        self.per_page
    }
}

/// Joins the markets path onto `base`, tolerating a missing trailing slash.
fn markets_endpoint(base: &str) -> Result<Url, FetchError> {
    let invalid = || FetchError::InvalidUrl {
        url: base.to_string(),
    };
    let mut base = Url::parse(base).map_err(|_| invalid())?;
    if base.cannot_be_a_base() {
        return Err(invalid());
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(MARKETS_PATH).map_err(|_| invalid())
}

fn user_agent() -> String {
    format!("marketcap-rank/{}", env!("CARGO_PKG_VERSION"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_markets_endpoint_joins_with_and_without_slash() {
        assert_eq!(
            markets_endpoint("https://api.example.com/api/v3").unwrap().as_str(),
            "https://api.example.com/api/v3/coins/markets"
        );
        assert_eq!(
            markets_endpoint("https://api.example.com/api/v3/").unwrap().as_str(),
            "https://api.example.com/api/v3/coins/markets"
        );
        assert_eq!(
            markets_endpoint("http://127.0.0.1:8080").unwrap().as_str(),
            "http://127.0.0.1:8080/coins/markets"
        );
    }

    #[test]
    fn test_markets_endpoint_rejects_garbage() {
        assert!(matches!(
            markets_endpoint("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_query_includes_key_only_when_set() {
        let client = MarketsClient::new(ClientConfig::default()).unwrap();
        assert!(!client.query(1).iter().any(|(k, _)| *k == "x_cg_demo_api_key"));

        let client = MarketsClient::new(ClientConfig {
            api_key: Some("secret".into()),
            ..ClientConfig::default()
        })
        .unwrap();
        let query = client.query(7);
        assert!(query.contains(&("x_cg_demo_api_key", "secret".to_string())));
        assert!(query.contains(&("page", "7".to_string())));
        assert!(query.contains(&("per_page", "250".to_string())));
    }

    #[test]
    fn test_blank_api_key_is_ignored() {
        let client = MarketsClient::new(ClientConfig {
            api_key: Some("  ".into()),
            ..ClientConfig::default()
        })
        .unwrap();
        assert!(!client.has_api_key());
    }
}
