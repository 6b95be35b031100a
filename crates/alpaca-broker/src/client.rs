use crate::models::*;
use analysis_core::{Bar, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use broker_trait::{
    is_crypto_symbol, AccountPort, AccountSnapshot, BrokerClient, BrokerError, MarketDataPort,
    OrderAck, OrderPort, OrderRequest, PositionSnapshot,
};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const PAPER_URL: &str = "https://paper-api.alpaca.markets";
pub const DATA_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    data_url: String,
}

impl AlpacaClient {
    /// Create a new Alpaca client
    pub fn new(
        api_key: String,
        secret_key: String,
        base_url: String,
        data_url: String,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&api_key)
                .context("API key contains invalid header characters")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&secret_key)
                .context("Secret key contains invalid header characters")?,
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
        })
    }

    /// Check if this client is connected to the paper trading environment
    pub fn is_paper(&self) -> bool {
        self.base_url.contains("paper-api")
    }

    /// Get the base URL (for logging/diagnostics)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        client_error: fn(String) -> BrokerError,
    ) -> Result<T, BrokerError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        decode(check_status(response, client_error).await?).await
    }

    async fn get_stock_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let url = format!("{}/v2/stocks/{}/bars", self.data_url, symbol);
        // unknown symbols come back as 4xx
        let resp: StockBarsResponse = self
            .get_json(&url, &bars_query(timeframe, limit), BrokerError::DataUnavailable)
            .await?;
        Ok(resp.bars.unwrap_or_default().into_iter().map(Bar::from).collect())
    }

    async fn get_crypto_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let url = format!("{}/v1beta3/crypto/us/bars", self.data_url);
        let mut query = bars_query(timeframe, limit);
        query.push(("symbols", symbol.to_string()));
        let mut resp: CryptoBarsResponse = self
            .get_json(&url, &query, BrokerError::DataUnavailable)
            .await?;
        Ok(resp
            .bars
            .remove(symbol)
            .unwrap_or_default()
            .into_iter()
            .map(Bar::from)
            .collect())
    }
}

/// Newest-first with a generous lookback so weekends and holidays still
/// leave `limit` bars; `get_bars` restores ascending order.
fn bars_query(timeframe: Timeframe, limit: usize) -> Vec<(&'static str, String)> {
    let span_minutes = timeframe.to_minutes() * limit as i64 * 2;
    let lookback = ChronoDuration::minutes(span_minutes.max(7 * 24 * 60));
    let start = Utc::now() - lookback;
    vec![
        ("timeframe", timeframe.as_api_str().to_string()),
        ("limit", limit.to_string()),
        ("start", start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        ("sort", "desc".to_string()),
    ]
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout(e.to_string())
    } else {
        BrokerError::Transport(e.to_string())
    }
}

/// Map a non-success HTTP status. `client_error` decides what a 4xx means
/// for the call at hand (order rejection vs. plain failure).
async fn check_status(
    response: Response,
    client_error: fn(String) -> BrokerError,
) -> Result<Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("Alpaca API error ({}): {}", status, body);
    Err(match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BrokerError::Timeout(message),
        s if s.is_client_error() => client_error(message),
        _ => BrokerError::Transport(message),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BrokerError> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| BrokerError::Malformed(e.to_string()))
}

#[async_trait]
impl MarketDataPort for AlpacaClient {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let mut bars = if is_crypto_symbol(symbol) {
            self.get_crypto_bars(symbol, timeframe, limit).await?
        } else {
            self.get_stock_bars(symbol, timeframe, limit).await?
        };

        if bars.is_empty() {
            return Err(BrokerError::DataUnavailable(format!(
                "no {} bars returned for {}",
                timeframe.as_api_str(),
                symbol
            )));
        }
        bars.sort_by_key(|b| b.timestamp);
        tracing::debug!("Fetched {} {} bars for {}", bars.len(), timeframe.as_api_str(), symbol);
        Ok(bars)
    }
}

#[async_trait]
impl AccountPort for AlpacaClient {
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let account: Account = self.get_json(&url, &[], BrokerError::Transport).await?;
        if account.trading_blocked || account.account_blocked {
            tracing::warn!("Alpaca account {} is blocked (status {})", account.id, account.status);
        }
        account.to_snapshot()
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        let url = format!("{}/v2/positions", self.base_url);
        let positions: Vec<Position> = self.get_json(&url, &[], BrokerError::Transport).await?;
        positions.iter().map(Position::to_snapshot).collect()
    }
}

#[async_trait]
impl OrderPort for AlpacaClient {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        let url = format!("{}/v2/orders", self.base_url);
        let body = OrderBody::from(order);

        tracing::info!("Submitting order to Alpaca: {:?}", body);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        // 403 (buying power) and 422 (invalid order) are broker-side rejections
        let response = check_status(response, BrokerError::Rejected).await?;
        let order: Order = decode(response).await?;

        tracing::info!("Order submitted successfully: {} ({})", order.id, order.status);
        Ok(order.to_ack())
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self.client.delete(&url).send().await.map_err(transport_error)?;
        check_status(response, BrokerError::Rejected).await?;

        tracing::info!("Order {} canceled successfully", order_id);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let order: Order = self.get_json(&url, &[], BrokerError::Transport).await?;
        Ok(order.to_ack())
    }
}

impl BrokerClient for AlpacaClient {
    fn is_paper(&self) -> bool {
        self.is_paper()
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}
