//! Lock state driven by the consensus layer
//!
//! This module provides:
//! - The immutable lock record
//! - Per-lock fencing token issuance
//! - The authoritative lock table with expiry

mod model;
mod store;
mod token;

pub use model::*;
pub use store::*;
pub use token::*;
