//! pagestore common - shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! identifier types used by the paged storage engine and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, Config, StorageConfig};
pub use error::{Error, Result};
pub use types::*;
