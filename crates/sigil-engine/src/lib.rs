//! Client-side sync and encryption engine for Sigil direct messages.
//!
//! A session resolves counterparty keys, decrypts relay traffic, reconciles
//! it with the local cache and exposes per-dialog timelines, unread counters
//! and typing indicators to whatever renders them.

pub mod cache_writer;
pub mod config;
pub mod contacts;
pub mod decrypt;
pub mod error;
pub mod inbox;
pub mod keys;
pub mod ledger;
pub mod observer;
pub mod outbound;
pub mod presence;
pub mod reconcile;
pub mod session;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use inbox::{ttl_secs, LoadState};
pub use keys::{Directory, HttpDirectory, KeyResolver, Profile, StaticDirectory};
pub use ledger::{Ledger, TxOutcome};
pub use observer::{NoopObserver, SessionObserver, TracingObserver};
pub use reconcile::Admission;
pub use session::{
    open_session, spawn_session, spawn_session_with_transport, SessionHandle, TimelineView,
};
