//! Common types shared across the LedgerSync crates.
//!
//! This module provides the error taxonomy and the small identifier types
//! that every layer of the sync core agrees on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{OpType, OperationId, RowKey, SyncState};
