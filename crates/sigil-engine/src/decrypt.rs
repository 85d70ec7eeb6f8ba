//! Decryption pipeline.
//!
//! Strategies are tried in order, stopping at the first that yields text:
//! the sender's self-copy, the counterparty box, literal legacy plaintext,
//! and finally an opaque placeholder. The crypto runs on the blocking pool
//! under a hard timeout so a slow call never stalls event dispatch.

use std::sync::Arc;
use std::time::Duration;

use sigil_shared::constants::{ENCRYPTED_PLACEHOLDER, ENCRYPTED_SENT_PLACEHOLDER};
use sigil_shared::crypto::{self, looks_encrypted};
use sigil_shared::{Address, Identity, Message};
use tracing::{debug, warn};
use x25519_dalek::PublicKey;

use crate::keys::KeyResolver;

#[derive(Debug, Clone)]
pub struct DecryptRequest {
    pub ciphertext: String,
    pub ciphertext_self: Option<String>,
    pub sender: Address,
    pub recipient: Option<Address>,
}

impl From<&Message> for DecryptRequest {
    fn from(m: &Message) -> Self {
        Self {
            ciphertext: m.ciphertext.clone(),
            ciphertext_self: m.ciphertext_self.clone(),
            sender: m.sender.clone(),
            recipient: m.recipient.clone(),
        }
    }
}

/// Which strategy produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptSource {
    SelfCopy,
    Counterparty,
    Plaintext,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub text: String,
    pub source: DecryptSource,
}

impl Decrypted {
    fn placeholder(outbound: bool) -> Self {
        let text = if outbound {
            ENCRYPTED_SENT_PLACEHOLDER
        } else {
            ENCRYPTED_PLACEHOLDER
        };
        Self {
            text: text.to_string(),
            source: DecryptSource::Placeholder,
        }
    }
}

#[derive(Clone)]
pub struct DecryptionPipeline {
    identity: Arc<Identity>,
    keys: Arc<KeyResolver>,
    timeout: Duration,
}

impl DecryptionPipeline {
    pub fn new(identity: Arc<Identity>, keys: Arc<KeyResolver>, timeout: Duration) -> Self {
        Self {
            identity,
            keys,
            timeout,
        }
    }

    /// Never fails: every fault ends in plaintext or a placeholder.
    pub async fn decrypt(&self, request: DecryptRequest) -> Decrypted {
        let outbound = &request.sender == self.identity.address();
        match tokio::time::timeout(self.timeout, self.run(request, outbound)).await {
            Ok(decrypted) => decrypted,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "decryption timed out");
                Decrypted::placeholder(outbound)
            }
        }
    }

    async fn run(&self, mut request: DecryptRequest, outbound: bool) -> Decrypted {
        // The self-copy needs no directory lookup, so try it on its own first.
        if outbound && request.ciphertext_self.is_some() {
            let Some((decrypted, returned)) = self.open_blocking(request, outbound, None).await
            else {
                return Decrypted::placeholder(outbound);
            };
            if decrypted.source == DecryptSource::SelfCopy {
                return decrypted;
            }
            request = returned;
            request.ciphertext_self = None;
        }

        let counterparty = if outbound {
            request.recipient.clone()
        } else {
            Some(request.sender.clone())
        };
        let their_key = match counterparty {
            Some(address) => self.keys.resolve(&address).await.map(|k| k.public_key),
            None => None,
        };

        match self.open_blocking(request, outbound, their_key).await {
            Some((decrypted, _)) => decrypted,
            None => Decrypted::placeholder(outbound),
        }
    }

    async fn open_blocking(
        &self,
        request: DecryptRequest,
        outbound: bool,
        their_key: Option<PublicKey>,
    ) -> Option<(Decrypted, DecryptRequest)> {
        let identity = self.identity.clone();
        let job = tokio::task::spawn_blocking(move || {
            let decrypted = open_in_order(&identity, outbound, &request, their_key);
            (decrypted, request)
        });
        match job.await {
            Ok(done) => Some(done),
            Err(e) => {
                warn!(error = %e, "decryption worker failed");
                None
            }
        }
    }
}

/// The synchronous strategy chain.
pub fn open_in_order(
    identity: &Identity,
    outbound: bool,
    request: &DecryptRequest,
    their_key: Option<PublicKey>,
) -> Decrypted {
    if outbound {
        if let Some(self_copy) = request.ciphertext_self.as_deref() {
            match open_text(self_copy, &identity.public_key(), identity) {
                Some(text) => {
                    return Decrypted {
                        text,
                        source: DecryptSource::SelfCopy,
                    }
                }
                None => debug!("self copy did not open"),
            }
        }
    }

    if let Some(their_key) = their_key {
        match open_text(&request.ciphertext, &their_key, identity) {
            Some(text) => {
                return Decrypted {
                    text,
                    source: DecryptSource::Counterparty,
                }
            }
            None => debug!(sender = %request.sender, "counterparty box did not open"),
        }
    }

    if !looks_encrypted(&request.ciphertext) {
        return Decrypted {
            text: request.ciphertext.clone(),
            source: DecryptSource::Plaintext,
        };
    }
    Decrypted::placeholder(outbound)
}

fn open_text(encoded: &str, their_key: &PublicKey, identity: &Identity) -> Option<String> {
    let bytes = crypto::open(encoded, their_key, identity.secret()).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use sigil_shared::crypto::seal;

    use super::*;
    use crate::keys::StaticDirectory;

    struct Pair {
        alice: Arc<Identity>,
        bob: Arc<Identity>,
        directory: Arc<StaticDirectory>,
    }

    fn pair() -> Pair {
        let alice = Arc::new(Identity::generate(Address::new("0xalice")).unwrap());
        let bob = Arc::new(Identity::generate(Address::new("0xbob")).unwrap());
        Pair {
            alice,
            bob,
            directory: Arc::new(StaticDirectory::new()),
        }
    }

    fn pipeline(me: &Arc<Identity>, directory: &Arc<StaticDirectory>) -> DecryptionPipeline {
        let keys = Arc::new(KeyResolver::new(directory.clone(), 16));
        DecryptionPipeline::new(me.clone(), keys, Duration::from_secs(5))
    }

    fn request(from: &Identity, to: &Identity, ciphertext: String, self_copy: Option<String>) -> DecryptRequest {
        DecryptRequest {
            ciphertext,
            ciphertext_self: self_copy,
            sender: from.address().clone(),
            recipient: Some(to.address().clone()),
        }
    }

    #[tokio::test]
    async fn test_recipient_opens_with_sender_key() {
        let p = pair();
        p.directory.publish(p.alice.address(), &p.alice.public_key(), None);
        let ct = seal(b"hello", &p.bob.public_key(), p.alice.secret()).unwrap();

        let out = pipeline(&p.bob, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct, None))
            .await;
        assert_eq!(out.text, "hello");
        assert_eq!(out.source, DecryptSource::Counterparty);
    }

    #[tokio::test]
    async fn test_sender_reads_self_copy_without_counterparty_key() {
        let p = pair();
        let ct = seal(b"to bob", &p.bob.public_key(), p.alice.secret()).unwrap();
        let self_ct = seal(b"to bob", &p.alice.public_key(), p.alice.secret()).unwrap();

        let out = pipeline(&p.alice, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct, Some(self_ct)))
            .await;
        assert_eq!(out.text, "to bob");
        assert_eq!(out.source, DecryptSource::SelfCopy);
    }

    #[tokio::test]
    async fn test_sender_falls_back_to_recipient_key() {
        let p = pair();
        p.directory.publish(p.bob.address(), &p.bob.public_key(), None);
        let ct = seal(b"sent", &p.bob.public_key(), p.alice.secret()).unwrap();

        let out = pipeline(&p.alice, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct, Some("garbage.selfcopy".into())))
            .await;
        assert_eq!(out.text, "sent");
        assert_eq!(out.source, DecryptSource::Counterparty);
    }

    #[tokio::test]
    async fn test_legacy_plaintext_passes_through() {
        let p = pair();
        let out = pipeline(&p.bob, &p.directory)
            .decrypt(request(&p.alice, &p.bob, "just text".into(), None))
            .await;
        assert_eq!(out.text, "just text");
        assert_eq!(out.source, DecryptSource::Plaintext);
    }

    #[tokio::test]
    async fn test_unopenable_box_becomes_placeholder() {
        let p = pair();
        let ct = seal(b"secret", &p.bob.public_key(), p.alice.secret()).unwrap();

        let inbound = pipeline(&p.bob, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct.clone(), None))
            .await;
        assert_eq!(inbound.text, ENCRYPTED_PLACEHOLDER);
        assert_eq!(inbound.source, DecryptSource::Placeholder);

        let outbound = pipeline(&p.alice, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct, None))
            .await;
        assert_eq!(outbound.text, ENCRYPTED_SENT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_wrong_key_becomes_placeholder() {
        let p = pair();
        let mallory = Identity::generate(Address::new("0xmallory")).unwrap();
        p.directory.publish(p.alice.address(), &mallory.public_key(), None);
        let ct = seal(b"hi", &p.bob.public_key(), p.alice.secret()).unwrap();

        let out = pipeline(&p.bob, &p.directory)
            .decrypt(request(&p.alice, &p.bob, ct, None))
            .await;
        assert_eq!(out.source, DecryptSource::Placeholder);
    }
}
