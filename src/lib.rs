pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod filter;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod sql;
pub mod wal;
pub mod wire;
