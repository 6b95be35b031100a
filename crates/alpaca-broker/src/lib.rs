pub mod client;
pub mod models;

pub use broker_trait::BrokerClient;
pub use client::{AlpacaClient, DATA_URL, PAPER_URL};
