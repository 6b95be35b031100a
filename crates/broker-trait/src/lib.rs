use analysis_core::{Bar, SignalAction, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Unknown symbol or no data for the requested window
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// The broker refused the order (buying power, market closed, bad symbol)
    #[error("order rejected by broker: {0}")]
    Rejected(String),

    #[error("broker call timed out: {0}")]
    Timeout(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("malformed broker response: {0}")]
    Malformed(String),
}

impl BrokerError {
    /// Whether retrying the same call could plausibly succeed. Order
    /// rejections never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Timeout(_) | BrokerError::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    /// Equity at the previous session close
    pub last_equity: f64,
}

impl AccountSnapshot {
    /// Realized plus unrealized change since the previous close.
    pub fn daily_pnl(&self) -> f64 {
        self.equity - self.last_equity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Negative for short positions
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

impl PositionSnapshot {
    /// Capital at risk regardless of direction.
    pub fn exposure(&self) -> f64 {
        self.market_value.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_action(action: SignalAction) -> Option<Self> {
        match action {
            SignalAction::Buy => Some(OrderSide::Buy),
            SignalAction::Sell => Some(OrderSide::Sell),
            SignalAction::Hold => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Either a unit count or a dollar amount; brokers accept exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAmount {
    Quantity(Decimal),
    Notional(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit { limit_price: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
        }
    }
}

/// Crypto pairs are written with a slash (`BTC/USD`) and trade around the clock.
pub fn is_crypto_symbol(symbol: &str) -> bool {
    symbol.contains('/')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub amount: OrderAmount,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order with the time-in-force the asset class needs.
    pub fn market(symbol: impl Into<String>, side: OrderSide, amount: OrderAmount) -> Self {
        let symbol = symbol.into();
        let time_in_force = if is_crypto_symbol(&symbol) {
            TimeInForce::Gtc
        } else {
            TimeInForce::Day
        };
        Self {
            symbol,
            side,
            amount,
            order_type: OrderType::Market,
            time_in_force,
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    /// Accepted but not (fully) filled yet
    Pending,
    Rejected,
    Canceled,
}

impl OrderStatus {
    /// Normalize a broker status string.
    pub fn from_broker_str(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "filled" => OrderStatus::Filled,
            "rejected" | "suspended" => OrderStatus::Rejected,
            "canceled" | "cancelled" | "expired" | "done_for_day" => OrderStatus::Canceled,
            // new, accepted, pending_new, partially_filled, calculated, ...
            _ => OrderStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Filled => "filled",
            OrderStatus::Pending => "pending",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Bars ascending by time, at most `limit` of the most recent.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError>;
}

#[async_trait]
pub trait AccountPort: Send + Sync {
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError>;
}

#[async_trait]
pub trait OrderPort: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError>;
}

/// A full broker connection: data, account and orders.
pub trait BrokerClient: MarketDataPort + AccountPort + OrderPort {
    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
