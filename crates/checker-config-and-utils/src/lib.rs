//! Configuration, cancellation and logging helpers shared by the prime
//! checker services.

mod config;
mod error;
mod logging;
mod shutdown;

pub use config::{
    Config, DEFAULT_LOG_LEVEL, DEFAULT_PUBLISH_INTERVAL_MS, MAX_PUBLISH_INTERVAL_MS,
    MIN_PUBLISH_INTERVAL_MS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_telemetry, telemetry_config};
pub use shutdown::{Shutdown, ShutdownSignal};
