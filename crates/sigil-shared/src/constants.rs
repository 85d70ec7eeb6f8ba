use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Sigil";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Number of address-hash bytes kept (hex-encoded to twice this length)
pub const ADDRESS_HASH_BYTES: usize = 16;

/// Key derivation context for direct-message box keys (BLAKE3)
pub const KDF_CONTEXT_DM_KEY: &str = "sigil-dm-key-v1";

/// Prefix of client-generated message ids awaiting a durable id
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Prefix of room timeline keys
pub const ROOM_PREFIX: &str = "room:";

/// Placeholder shown for an inbound message that could not be opened
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted Message]";

/// Placeholder shown for an outbound message that could not be opened
pub const ENCRYPTED_SENT_PLACEHOLDER: &str = "[Encrypted Sent Message]";

/// Quoted preview of a reply whose target was deleted
pub const DELETED_PREVIEW: &str = "message deleted";

/// Address values the relay uses when it cannot name a participant
pub const UNKNOWN_ADDRESSES: &[&str] = &["", "unknown", "0x0"];

/// Reconnect backoff bounds
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Heartbeat interval while the relay connection is open
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Upper bound on a single connect attempt, handshake included
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one profile directory lookup
pub const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard ceiling on a single decryption call
pub const DECRYPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typing indicators clear after this long without a refresh
pub const TYPING_WINDOW: Duration = Duration::from_secs(3);

/// Disappearing-message sweep period
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default capacities for the bounded session caches
pub const KEY_CACHE_CAPACITY: usize = 512;
pub const ADMITTED_CAPACITY: usize = 10_000;

/// Default page size for dialog history reads
pub const PAGE_SIZE: usize = 50;

/// Maximum characters kept in contact and reply previews
pub const PREVIEW_CHARS: usize = 80;
