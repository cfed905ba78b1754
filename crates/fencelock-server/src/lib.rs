// Fencelock server library
// Configuration, logging, metrics registration and the in-process cluster console

pub mod console; // Interactive lock console
pub mod metrics; // Metric descriptions
pub mod model; // Configuration models
pub mod startup; // Logging and deployment startup

pub use model::{Cli, Configuration};
