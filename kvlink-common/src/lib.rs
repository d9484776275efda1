// kvlink-common - Shared result codes and error types for KVLink
//
// This crate defines the closed error taxonomy every client operation reports.

pub mod error;

// Re-export for convenience
pub use error::*;
