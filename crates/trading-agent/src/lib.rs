pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod orchestrator;
pub mod positions;

#[cfg(test)]
mod tests;

pub use config::AgentConfig;
pub use error::CycleError;
pub use execution::{ExecutionReport, ExecutionRouter, ExecutionStatus};
pub use metrics::AgentMetrics;
pub use orchestrator::{
    CycleComponents, CycleRequest, CycleSettings, CycleStatus, TradeCycleResult,
    TradingCycleOrchestrator,
};
pub use positions::{ClosedTrade, OpenEntry, PositionTracker};
