//! Types and primitives shared by every Sigil crate: wallet identity,
//! dialog keys, the message model, the X25519 box and the relay protocol.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::Identity;
pub use model::{Contact, DisappearingTimer, Message, Reactions};
pub use types::{Address, AddressHash, ConnectionState, DialogId, MessageId, MessageStatus};
