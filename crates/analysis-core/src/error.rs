use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Insufficient data: need at least {required} bars, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("No strategy produced a usable signal for {0}")]
    NoUsableSignal(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
