use std::collections::HashMap;
use std::str::FromStr;

use analysis_core::Bar;
use broker_trait::{
    AccountSnapshot, BrokerError, OrderAck, OrderAmount, OrderRequest, OrderSide, OrderStatus,
    OrderType, PositionSnapshot,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn parse_f64(field: &str, value: &str) -> Result<f64, BrokerError> {
    value
        .parse::<f64>()
        .map_err(|_| BrokerError::Malformed(format!("{} is not a number: '{}'", field, value)))
}

fn parse_decimal(value: Option<&str>) -> Option<Decimal> {
    value.and_then(|s| Decimal::from_str(s).ok())
}

// ---------------------------------------------------------------------------
// Trading API
// ---------------------------------------------------------------------------

/// Alpaca reports money as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub status: String,
    pub equity: String,
    pub last_equity: String,
    pub cash: String,
    pub buying_power: String,
    #[serde(default)]
    pub trading_blocked: bool,
    #[serde(default)]
    pub account_blocked: bool,
}

impl Account {
    pub fn to_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(AccountSnapshot {
            equity: parse_f64("equity", &self.equity)?,
            cash: parse_f64("cash", &self.cash)?,
            buying_power: parse_f64("buying_power", &self.buying_power)?,
            last_equity: parse_f64("last_equity", &self.last_equity)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: String,
    pub side: String,
    pub avg_entry_price: String,
    pub market_value: String,
    pub unrealized_pl: String,
    pub current_price: String,
}

impl Position {
    pub fn to_snapshot(&self) -> Result<PositionSnapshot, BrokerError> {
        let mut quantity = parse_f64("qty", &self.qty)?;
        // qty is unsigned on some endpoints; side is authoritative
        if self.side.eq_ignore_ascii_case("short") && quantity > 0.0 {
            quantity = -quantity;
        }
        Ok(PositionSnapshot {
            symbol: self.symbol.clone(),
            quantity,
            avg_entry_price: parse_f64("avg_entry_price", &self.avg_entry_price)?,
            current_price: parse_f64("current_price", &self.current_price)?,
            market_value: parse_f64("market_value", &self.market_value)?,
            unrealized_pnl: parse_f64("unrealized_pl", &self.unrealized_pl)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<String>, // Dollar amount instead of quantity
    pub side: &'static str,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl From<&OrderRequest> for OrderBody {
    fn from(req: &OrderRequest) -> Self {
        let (qty, notional) = match req.amount {
            OrderAmount::Quantity(q) => (Some(q.normalize().to_string()), None),
            OrderAmount::Notional(n) => (None, Some(n.round_dp(2).to_string())),
        };
        let (order_type, limit_price) = match req.order_type {
            OrderType::Market => ("market", None),
            OrderType::Limit { limit_price } => ("limit", Some(limit_price.to_string())),
        };
        Self {
            symbol: req.symbol.clone(),
            qty,
            notional,
            side: match req.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            order_type,
            time_in_force: req.time_in_force.as_str(),
            limit_price,
            client_order_id: req.client_order_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub symbol: String,
    #[serde(default)]
    pub filled_qty: Option<String>,
    #[serde(default)]
    pub filled_avg_price: Option<String>,
    pub status: String,
}

impl Order {
    pub fn to_ack(&self) -> OrderAck {
        OrderAck {
            order_id: self.id.clone(),
            client_order_id: self.client_order_id.clone(),
            symbol: self.symbol.clone(),
            status: OrderStatus::from_broker_str(&self.status),
            filled_qty: parse_decimal(self.filled_qty.as_deref()),
            filled_avg_price: parse_decimal(self.filled_avg_price.as_deref()),
            submitted_at: self.submitted_at.unwrap_or(self.created_at),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaBar {
    pub t: DateTime<Utc>,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    #[serde(default)]
    pub vw: Option<f64>,
}

impl From<AlpacaBar> for Bar {
    fn from(b: AlpacaBar) -> Self {
        Bar {
            timestamp: b.t,
            open: b.o,
            high: b.h,
            low: b.l,
            close: b.c,
            volume: b.v,
            vwap: b.vw,
        }
    }
}

/// `GET /v2/stocks/{symbol}/bars`
#[derive(Debug, Deserialize)]
pub struct StockBarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<AlpacaBar>>,
}

/// `GET /v1beta3/crypto/us/bars`, keyed by pair
#[derive(Debug, Deserialize)]
pub struct CryptoBarsResponse {
    #[serde(default)]
    pub bars: HashMap<String, Vec<AlpacaBar>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn account_strings_parse() {
        let raw = r#"{"id":"a1","status":"ACTIVE","equity":"10250.50","last_equity":"10000",
            "cash":"4000","buying_power":"8000","trading_blocked":false}"#;
        let account: Account = serde_json::from_str(raw).unwrap();
        let snap = account.to_snapshot().unwrap();
        assert_eq!(snap.equity, 10250.5);
        assert_eq!(snap.daily_pnl(), 250.5);
    }

    #[test]
    fn bad_number_is_malformed() {
        let account = Account {
            id: "a1".into(),
            status: "ACTIVE".into(),
            equity: "n/a".into(),
            last_equity: "0".into(),
            cash: "0".into(),
            buying_power: "0".into(),
            trading_blocked: false,
            account_blocked: false,
        };
        assert!(matches!(account.to_snapshot(), Err(BrokerError::Malformed(_))));
    }

    #[test]
    fn short_positions_are_negative() {
        let raw = r#"{"symbol":"TSLA","qty":"5","side":"short","avg_entry_price":"200",
            "market_value":"-950","unrealized_pl":"50","current_price":"190"}"#;
        let pos: Position = serde_json::from_str(raw).unwrap();
        let snap = pos.to_snapshot().unwrap();
        assert_eq!(snap.quantity, -5.0);
        assert_eq!(snap.exposure(), 950.0);
    }

    #[test]
    fn notional_body_omits_qty() {
        let req = OrderRequest::market("AAPL", OrderSide::Buy, OrderAmount::Notional(dec!(250.456)));
        let body = serde_json::to_value(OrderBody::from(&req)).unwrap();
        assert_eq!(body["notional"], "250.46");
        assert!(body.get("qty").is_none());
        assert_eq!(body["type"], "market");
        assert_eq!(body["time_in_force"], "day");
    }

    #[test]
    fn crypto_body_is_gtc() {
        let req = OrderRequest::market("ETH/USD", OrderSide::Sell, OrderAmount::Quantity(dec!(0.500)));
        let body = serde_json::to_value(OrderBody::from(&req)).unwrap();
        assert_eq!(body["qty"], "0.5");
        assert_eq!(body["time_in_force"], "gtc");
        assert_eq!(body["side"], "sell");
    }

    #[test]
    fn order_maps_to_ack() {
        let raw = r#"{"id":"o-1","client_order_id":"c-1","created_at":"2024-03-01T15:00:00Z",
            "symbol":"AAPL","filled_qty":"2","filled_avg_price":"180.25","status":"filled"}"#;
        let order: Order = serde_json::from_str(raw).unwrap();
        let ack = order.to_ack();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_avg_price, Some(dec!(180.25)));
        assert_eq!(ack.submitted_at, order.created_at);
    }

    #[test]
    fn stock_bars_decode() {
        let raw = r#"{"bars":[{"t":"2024-03-01T05:00:00Z","o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":100,"n":3,"vw":1.2}],
            "symbol":"AAPL","next_page_token":null}"#;
        let resp: StockBarsResponse = serde_json::from_str(raw).unwrap();
        let bars: Vec<Bar> = resp.bars.unwrap().into_iter().map(Bar::from).collect();
        assert_eq!(bars[0].close, 1.5);
        assert_eq!(bars[0].vwap, Some(1.2));
    }
}
