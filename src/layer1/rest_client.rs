// REST Client - depth snapshot anchors from the exchange
// Retrying HTTP fetch with optional proxy; public endpoints only

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::Market;
use crate::layer2::parser::{parse_depth_snapshot, DepthSnapshot, ParseError};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Payload error: {0}")]
    Payload(#[from] ParseError),
    #[error("All {0} snapshot attempts failed")]
    AttemptsExhausted(u32),
}

/// Depth-snapshot fetcher for both markets.
pub struct DepthRestClient {
    client: Client,
    futures_url: String,
    spot_url: String,
    attempts: u32,
}

impl DepthRestClient {
    pub fn new(cfg: &ExchangeConfig) -> Result<Self, RestError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(cfg.rest_timeout_secs));
        if let Some(proxy_url) = &cfg.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url.as_str())?);
        }
        Ok(Self {
            client: builder.build()?,
            futures_url: cfg.futures_depth_url.clone(),
            spot_url: cfg.spot_depth_url.clone(),
            attempts: cfg.rest_attempts.max(1),
        })
    }

    /// Fetch a depth snapshot, retrying transient failures with exponential
    /// delay (2s, 4s, 8s ...).
    pub async fn fetch_depth(&self, market: Market) -> Result<DepthSnapshot, RestError> {
        let url = match market {
            Market::Futures => &self.futures_url,
            Market::Spot => &self.spot_url,
        };

        for attempt in 1..=self.attempts {
            match self.try_fetch(url).await {
                Ok(snap) => {
                    debug!(
                        market = %market,
                        last_update_id = snap.last_update_id,
                        bids = snap.bids.len(),
                        asks = snap.asks.len(),
                        "depth snapshot fetched"
                    );
                    return Ok(snap);
                }
                Err(RestError::Payload(e)) => {
                    // Malformed body will not improve on retry
                    error!(market = %market, error = %e, "malformed depth snapshot");
                    return Err(RestError::Payload(e));
                }
                Err(e) => {
                    warn!(
                        market = %market,
                        attempt = attempt,
                        max = self.attempts,
                        error = %e,
                        "depth snapshot attempt failed"
                    );
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(Duration::from_secs(2u64 << (attempt - 1))).await;
            }
        }

        error!(market = %market, "depth snapshot attempts exhausted");
        Err(RestError::AttemptsExhausted(self.attempts))
    }

    async fn try_fetch(&self, url: &str) -> Result<DepthSnapshot, RestError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RestError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        Ok(parse_depth_snapshot(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_defaults() {
        let cfg = ExchangeConfig::default();
        let client = DepthRestClient::new(&cfg).unwrap();
        assert_eq!(client.attempts, 3);
    }

    #[test]
    fn test_socks_proxy_is_accepted() {
        let mut cfg = ExchangeConfig::default();
        cfg.proxy_url = Some("socks5://127.0.0.1:1080".to_string());
        assert!(DepthRestClient::new(&cfg).is_ok());
    }
}
