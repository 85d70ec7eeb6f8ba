use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_DM_KEY, NONCE_SIZE, PUBKEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// X25519 agreement, then BLAKE3 KDF with domain separation. The agreement is
// symmetric, so sender and recipient derive the same key.
pub fn derive_box_key(my_secret: &StaticSecret, their_public: &PublicKey) -> SymmetricKey {
    let shared = my_secret.diffie_hellman(their_public);
    blake3::derive_key(KDF_CONTEXT_DM_KEY, shared.as_bytes())
}

/// Seal `plaintext` for `their_public`. Output is `base64(nonce).base64(ciphertext)`.
pub fn seal(
    plaintext: &[u8],
    their_public: &PublicKey,
    my_secret: &StaticSecret,
) -> Result<String, CryptoError> {
    let key = derive_box_key(my_secret, their_public);
    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(format!("{}.{}", B64.encode(nonce_bytes), B64.encode(ciphertext)))
}

/// Open a value produced by [`seal`]. The recipient passes the sender's
/// public key; the sender passes the recipient's.
pub fn open(
    encoded: &str,
    their_public: &PublicKey,
    my_secret: &StaticSecret,
) -> Result<Vec<u8>, CryptoError> {
    let (nonce_b64, body_b64) = encoded
        .split_once('.')
        .ok_or(CryptoError::MalformedCiphertext)?;
    let nonce_bytes = B64
        .decode(nonce_b64)
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedCiphertext);
    }
    let body = B64
        .decode(body_b64)
        .map_err(|_| CryptoError::MalformedCiphertext)?;

    let key = derive_box_key(my_secret, their_public);
    let cipher = XChaCha20Poly1305::new((&key).into());

    cipher
        .decrypt(XNonce::from_slice(&nonce_bytes), body.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Heuristic for "this is a sealed box, not legacy plaintext": exactly two
/// non-empty dot-separated parts, both drawn from the base64 alphabet.
pub fn looks_encrypted(s: &str) -> bool {
    let mut parts = s.split('.');
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    is_base64ish(a) && is_base64ish(b)
}

fn is_base64ish(part: &str) -> bool {
    part.len() >= 4
        && part
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'+' | b'/' | b'='))
}

pub fn encode_public_key(key: &PublicKey) -> String {
    B64.encode(key.as_bytes())
}

pub fn decode_public_key(s: &str) -> Result<PublicKey, CryptoError> {
    let bytes = B64
        .decode(s.trim())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    let arr: [u8; PUBKEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn test_recipient_opens() {
        let (alice_sk, alice_pk) = keypair();
        let (bob_sk, bob_pk) = keypair();

        let sealed = seal(b"hello", &bob_pk, &alice_sk).unwrap();
        assert_eq!(open(&sealed, &alice_pk, &bob_sk).unwrap(), b"hello");
    }

    #[test]
    fn test_sender_opens_own_message() {
        let (alice_sk, _) = keypair();
        let (_, bob_pk) = keypair();

        let sealed = seal(b"hello", &bob_pk, &alice_sk).unwrap();
        assert_eq!(open(&sealed, &bob_pk, &alice_sk).unwrap(), b"hello");
    }

    #[test]
    fn test_self_sealed_copy() {
        let (alice_sk, alice_pk) = keypair();
        let sealed = seal(b"note to self", &alice_pk, &alice_sk).unwrap();
        assert_eq!(open(&sealed, &alice_pk, &alice_sk).unwrap(), b"note to self");
    }

    #[test]
    fn test_wrong_key_fails() {
        let (alice_sk, alice_pk) = keypair();
        let (_, bob_pk) = keypair();
        let (eve_sk, _) = keypair();

        let sealed = seal(b"secret", &bob_pk, &alice_sk).unwrap();
        assert!(matches!(
            open(&sealed, &alice_pk, &eve_sk),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_sealed_output_is_classified_encrypted() {
        let (alice_sk, _) = keypair();
        let (_, bob_pk) = keypair();
        let sealed = seal(b"x", &bob_pk, &alice_sk).unwrap();
        assert!(looks_encrypted(&sealed));
    }

    #[test]
    fn test_plain_text_not_classified_encrypted() {
        assert!(!looks_encrypted("hello there"));
        assert!(!looks_encrypted("see you at 5. bring snacks"));
        assert!(!looks_encrypted("a.b.c"));
        assert!(!looks_encrypted("v1.2"));
    }

    #[test]
    fn test_malformed_ciphertext() {
        let (alice_sk, alice_pk) = keypair();
        assert!(matches!(
            open("no-dot-here", &alice_pk, &alice_sk),
            Err(CryptoError::MalformedCiphertext)
        ));
    }

    #[test]
    fn test_public_key_text_roundtrip() {
        let (_, pk) = keypair();
        assert_eq!(decode_public_key(&encode_public_key(&pk)).unwrap(), pk);
        assert!(decode_public_key("AAAA").is_err());
    }
}
