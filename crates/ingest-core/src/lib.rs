pub mod bucket;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod store;
