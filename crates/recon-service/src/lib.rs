pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod locks;
pub mod pg_store;
pub mod reconciler;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
