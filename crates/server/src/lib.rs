//! Metrics collector: accepts gauge and counter updates over HTTP and keeps
//! them in memory, checkpointed to a JSON file, or in SQLite.

pub mod api;
pub mod app;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod storage;

pub use app::run;
pub use config::ServerArgs;
pub use config::ServerConfig;
