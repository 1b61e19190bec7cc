//! Common utilities and types shared across fieldsync crates.
//!
//! This module provides the error type and the record model that every
//! other crate in the workspace speaks.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{RecordType, SyncableRecord};
