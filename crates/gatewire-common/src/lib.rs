//! Gatewire Common Library
//!
//! Shared types and utilities for the gatewire proxy core and the container
//! file tooling.

pub mod config;
pub mod cursor;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cursor::ByteCursor;
pub use error::{DecodeError, GatewireError, Result};
