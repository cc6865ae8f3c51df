pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod gate;
pub mod http;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;
