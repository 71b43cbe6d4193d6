//! Core constants, error types and shared enums.

mod constants;
mod error;
mod types;

pub use constants::*;
pub use error::*;
pub use types::*;
