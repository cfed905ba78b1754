//! Application startup utilities module.

mod cluster;
mod logging;

pub use cluster::LocalDeployment;
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
