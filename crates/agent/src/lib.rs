//! Telemetry agent: samples process and host statistics on a fixed interval and
//! reports them to a metrics collector over HTTP.

pub mod agent;
pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod sampler;
pub mod transport;

pub use agent::run;
pub use agent::run_with;
pub use config::AgentArgs;
pub use config::AgentConfig;
