use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("No fills found for order {order_id} on {symbol}")]
    NotFound { order_id: String, symbol: String },
    #[error("Exchange credentials are not configured")]
    MissingCredentials,
    #[error("Exchange request failed: {0}")]
    Request(String),
    #[error("Exchange API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Invalid exchange response: {0}")]
    InvalidResponse(String),
}

/// Read-only exchange data the ingest pipeline enriches fills with.
#[async_trait]
pub trait ExchangeData: Send + Sync {
    /// Realized profit/loss booked by the fills of one order.
    async fn lookup_realized_pnl(&self, order_id: &str, symbol: &str) -> Result<f64, ExchangeError>;
}

/// Converts `ETH/USDT` or `ETH/USDT:USDT` into the exchange's `ETHUSDT`.
pub fn exchange_symbol(symbol: &str) -> String {
    let base = symbol.split(':').next().unwrap_or(symbol);
    base.replace(['/', '-'], "").to_ascii_uppercase()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTrade {
    realized_pnl: String,
}

/// USD-M futures account trades, used to read realized PnL per order.
#[derive(Debug, Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl BinanceFuturesClient {
    pub fn new(base_url: String, api_key: Option<String>, api_secret: Option<String>, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    /// HMAC-SHA256 of the query string, hex encoded.
    fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Request(format!("invalid signing key: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ExchangeData for BinanceFuturesClient {
    async fn lookup_realized_pnl(&self, order_id: &str, symbol: &str) -> Result<f64, ExchangeError> {
        let (Some(api_key), Some(api_secret)) = (self.api_key.as_deref(), self.api_secret.as_deref()) else {
            return Err(ExchangeError::MissingCredentials);
        };
        let pair = exchange_symbol(symbol);
        let query = format!(
            "symbol={pair}&orderId={order_id}&timestamp={}",
            Utc::now().timestamp_millis()
        );
        let signature = Self::sign(api_secret, &query)?;
        let url = format!("{}/fapi/v1/userTrades?{query}&signature={signature}", self.base_url);

        debug!(order_id, symbol = %pair, "Looking up realized PnL.");
        let response = self
            .client
            .get(url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Api { status, body });
        }
        let fills: Vec<UserTrade> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
        if fills.is_empty() {
            return Err(ExchangeError::NotFound {
                order_id: order_id.to_string(),
                symbol: pair,
            });
        }
        fills.iter().try_fold(0.0, |total, fill| {
            fill.realized_pnl
                .parse::<f64>()
                .map(|pnl| total + pnl)
                .map_err(|e| ExchangeError::InvalidResponse(format!("realizedPnl '{}': {e}", fill.realized_pnl)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_symbol() {
        assert_eq!(exchange_symbol("ETH/USDT"), "ETHUSDT");
        assert_eq!(exchange_symbol("ETH/USDT:USDT"), "ETHUSDT");
        assert_eq!(exchange_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn test_signature_format() {
        let signature = BinanceFuturesClient::sign("test_secret", "symbol=ETHUSDT&orderId=1&timestamp=1").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_lookup_without_credentials() {
        let client = BinanceFuturesClient::new("https://fapi.binance.com".to_string(), None, None, Duration::from_secs(1));
        assert_eq!(
            client.lookup_realized_pnl("1", "ETH/USDT").await,
            Err(ExchangeError::MissingCredentials)
        );
    }
}
