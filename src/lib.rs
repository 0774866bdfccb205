pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reconcile;
pub mod replica;
pub mod resolver;
pub mod store;
pub mod sweep;
pub mod wal;
