pub mod backoff;
pub mod logging;
pub mod shutdown;
pub mod version;
