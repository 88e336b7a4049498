//! Data models for litedb.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod param;

// Re-export commonly used types
pub use connection::{DatabaseType, mask_url};
pub use param::{Row, SqlParam};
