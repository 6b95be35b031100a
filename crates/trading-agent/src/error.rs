use analysis_core::AnalysisError;
use broker_trait::BrokerError;
use thiserror::Error;

/// Why a trading cycle ended in `status = error`. The `Display` text is
/// what operators see in `TradeCycleResult.error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CycleError {
    #[error("invalid cycle request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    #[error("cycle task failed: {0}")]
    Internal(String),
}
