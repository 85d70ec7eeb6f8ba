//! Engine error types.

use sigil_shared::{Address, CryptoError, IdentityError, ProtocolError};
use sigil_store::StoreError;
use thiserror::Error;

/// Errors surfaced to callers of the session API. Faults on the live event
/// path are logged and absorbed instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("recipient address is a placeholder")]
    UnknownRecipient,

    #[error("no encryption key published for {0}")]
    RecipientKeyUnavailable(Address),

    #[error("directory request failed: {0}")]
    Directory(String),

    #[error("ledger query failed: {0}")]
    Ledger(String),

    #[error("session is shut down")]
    SessionClosed,

    #[error("cache worker is gone")]
    CacheClosed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Directory(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
