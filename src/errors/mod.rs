//! # Error Handling
//!
//! Error types for the keepsake storage layer, built on `thiserror`.

pub mod types;

pub use types::{KeepsakeError, Result};
