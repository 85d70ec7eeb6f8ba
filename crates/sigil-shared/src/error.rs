use thiserror::Error;

/// Failures of the X25519 box. Callers on the receive path treat every
/// variant the same way: fall through to the next decryption strategy.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    /// Not `base64(nonce).base64(ciphertext)`, or a nonce of the wrong size.
    #[error("Malformed ciphertext encoding")]
    MalformedCiphertext,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    /// Placeholder addresses such as `0x0` cannot own a keypair.
    #[error("Invalid wallet address")]
    InvalidAddress,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
