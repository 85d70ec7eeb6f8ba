//! # sigil-store
//!
//! Local durable cache for the Sigil engine: messages (with their resolved
//! plaintext), contacts and per-dialog settings.
//!
//! The engine only talks to the [`CacheStore`] trait. [`Database`] backs it
//! with SQLite; [`MemoryStore`] keeps everything in process memory.

pub mod cache;
pub mod contacts;
pub mod database;
pub mod dialogs;
pub mod memory;
pub mod messages;
pub mod migrations;

mod error;

pub use cache::CacheStore;
pub use database::{default_data_dir, Database};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
