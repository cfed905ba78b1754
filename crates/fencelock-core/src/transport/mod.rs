// Transports connecting lock nodes inside and across regions

pub mod local;

pub use local::{LocalLockClient, LocalRegion, LocalRegionClient, LocalRegionDirectory};
