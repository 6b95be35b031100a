pub mod error;
pub mod performance;
pub mod stats;
pub mod types;

pub use error::*;
pub use performance::*;
pub use types::*;
