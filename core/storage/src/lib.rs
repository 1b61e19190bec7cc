//! Durable key-value persistence for fieldsync.
//!
//! The sync engine keeps its configuration and bookkeeping as independently
//! keyed records in a generic key-value store. This crate provides the trait
//! and two backends.
//!
//! # Design Principles
//! - Values are opaque bytes; typing and versioning live with the caller
//! - Async operations: all I/O operations are async
//! - A missing key is `Ok(None)`, never an error

pub mod store;
pub mod memory;
pub mod local;

pub use store::KeyValueStore;
pub use memory::MemoryStore;
pub use local::FileStore;
