pub mod learning;
pub mod models;
pub mod persistence;
pub mod recorder;


pub use learning::{LearningConfig, LearningEngine};
pub use models::*;
pub use persistence::{PersistencePort, SqlPersistence};
pub use recorder::{AnalyticsRecorder, PendingWrite};
