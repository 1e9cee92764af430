pub mod archive;
pub mod auth;
pub mod config;
pub mod engine;
pub mod keys;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod wal;
