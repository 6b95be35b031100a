use std::sync::Arc;
use std::time::Duration;

use analysis_core::Signal;
use broker_trait::{
    BrokerError, OrderAck, OrderAmount, OrderPort, OrderRequest, OrderSide, OrderStatus,
};
use risk_manager::Sizing;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CycleError;

pub(crate) const SUBMIT_STAGE: &str = "order submission";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Filled,
    /// Accepted by the broker, not filled yet
    Pending,
    Rejected,
    /// Dry run: everything but the broker call happened
    WouldExecute,
}

impl ExecutionStatus {
    fn from_ack(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Filled => ExecutionStatus::Filled,
            OrderStatus::Pending => ExecutionStatus::Pending,
            OrderStatus::Rejected | OrderStatus::Canceled => ExecutionStatus::Rejected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Filled => "filled",
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::WouldExecute => "would_execute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub status: ExecutionStatus,
    pub request: OrderRequest,
    pub filled_qty: Option<f64>,
    pub filled_avg_price: Option<f64>,
}

/// The only component that moves capital. Every order goes out once;
/// nothing here retries a submission.
pub struct ExecutionRouter {
    orders: Arc<dyn OrderPort>,
    timeout: Duration,
}

impl ExecutionRouter {
    pub fn new(orders: Arc<dyn OrderPort>, timeout: Duration) -> Self {
        Self { orders, timeout }
    }

    /// Submit a market order for `signal` at `sizing`. With `dry_run` the
    /// request is built and validated but never sent.
    pub async fn execute(
        &self,
        signal: &Signal,
        sizing: Sizing,
        dry_run: bool,
    ) -> Result<ExecutionReport, CycleError> {
        let side = OrderSide::from_action(signal.action).ok_or_else(|| {
            CycleError::InvalidRequest(format!("cannot execute a HOLD signal for {}", signal.symbol))
        })?;
        let request = OrderRequest::market(&signal.symbol, side, order_amount(sizing)?)
            .with_client_order_id(Uuid::new_v4().to_string());
        self.send(request, dry_run).await
    }

    /// Flatten a tracked entry with an opposite-side market order.
    pub async fn close_entry(
        &self,
        symbol: &str,
        entry_side: OrderSide,
        quantity: f64,
        dry_run: bool,
    ) -> Result<ExecutionReport, CycleError> {
        let amount = order_amount(Sizing::Quantity(quantity.abs()))?;
        let request = OrderRequest::market(symbol, entry_side.opposite(), amount)
            .with_client_order_id(Uuid::new_v4().to_string());
        self.send(request, dry_run).await
    }

    /// Explicit cancel; never called as a side effect of another operation.
    pub async fn cancel(&self, order_id: &str) -> Result<(), CycleError> {
        bounded("order cancel", self.timeout, self.orders.cancel(order_id)).await?;
        tracing::info!("Canceled order {}", order_id);
        Ok(())
    }

    pub async fn order_status(&self, order_id: &str) -> Result<OrderAck, CycleError> {
        bounded("order lookup", self.timeout, self.orders.get_order(order_id)).await
    }

    async fn send(
        &self,
        request: OrderRequest,
        dry_run: bool,
    ) -> Result<ExecutionReport, CycleError> {
        if dry_run {
            let order_id = format!("dry-run-{}", Uuid::new_v4());
            tracing::info!(
                "[DRY RUN] Would {} {} ({:?}) as {}",
                request.side.as_str(),
                request.symbol,
                request.amount,
                order_id
            );
            return Ok(ExecutionReport {
                order_id,
                status: ExecutionStatus::WouldExecute,
                request,
                filled_qty: None,
                filled_avg_price: None,
            });
        }

        let ack = bounded(SUBMIT_STAGE, self.timeout, self.orders.submit(&request)).await?;
        let status = ExecutionStatus::from_ack(ack.status);
        tracing::info!(
            "Order {} for {} {}: {}",
            ack.order_id,
            request.side.as_str(),
            request.symbol,
            status.as_str()
        );
        Ok(ExecutionReport {
            order_id: ack.order_id,
            status,
            request,
            filled_qty: ack.filled_qty.and_then(|q| q.to_f64()),
            filled_avg_price: ack.filled_avg_price.and_then(|p| p.to_f64()),
        })
    }
}

/// Notional goes out in cents, quantity truncated to 6 decimals so
/// fractional orders never round up past the approved size.
fn order_amount(sizing: Sizing) -> Result<OrderAmount, CycleError> {
    let (raw, dp, build): (f64, u32, fn(Decimal) -> OrderAmount) = match sizing {
        Sizing::Notional(n) => (n, 2, OrderAmount::Notional),
        Sizing::Quantity(q) => (q, 6, OrderAmount::Quantity),
    };
    let value = Decimal::from_f64(raw)
        .map(|d| d.round_dp_with_strategy(dp, RoundingStrategy::ToZero))
        .filter(|d| d.is_sign_positive() && !d.is_zero())
        .ok_or_else(|| CycleError::InvalidRequest(format!("order size {} is not tradable", raw)))?;
    Ok(build(value))
}

async fn bounded<T>(
    stage: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, BrokerError>>,
) -> Result<T, CycleError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CycleError::from),
        Err(_) => Err(CycleError::Timeout {
            stage,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
