//! Review harvesting for app marketplaces: source-address rotation, classified retries,
//! change-detection gating and budgeted locale-partitioned collection.
pub mod address_pool;
pub mod allocator;
pub mod collection_state;
pub mod config;
pub mod database_ops;
pub mod locale;
pub mod marketplace;
pub mod orchestrator;
pub mod source;
pub mod tracing;
pub mod transport;

pub mod util {
    pub mod env;
}

pub use config::HarvestConfig;
pub use database_ops::{Db, StoreUnavailable};
pub use marketplace::Marketplace;
