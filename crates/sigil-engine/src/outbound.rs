//! Building outgoing direct messages.

use chrono::{DateTime, Utc};
use sigil_shared::crypto::seal;
use sigil_shared::protocol::ClientFrame;
use sigil_shared::{Address, DialogId, Identity, Message, MessageId, MessageStatus};
use x25519_dalek::PublicKey;

use crate::error::{EngineError, Result};

/// What the user asked to send.
#[derive(Debug, Clone)]
pub struct Draft {
    pub recipient: Address,
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub attachment_ref: Option<String>,
}

/// A sealed message ready for the local timeline and the wire.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub message: Message,
    pub frame: ClientFrame,
}

/// Seal `draft` twice, once for the recipient and once for ourselves, under
/// the temporary id `temp_{seq}`.
pub fn prepare(
    identity: &Identity,
    recipient_key: &PublicKey,
    draft: Draft,
    seq: u64,
    now: DateTime<Utc>,
) -> Result<Prepared> {
    if draft.recipient.is_unknown() {
        return Err(EngineError::UnknownRecipient);
    }
    let me = identity.address();
    let ciphertext = seal(draft.text.as_bytes(), recipient_key, identity.secret())?;
    let ciphertext_self = seal(draft.text.as_bytes(), &identity.public_key(), identity.secret())?;

    let temp_id = MessageId::temporary(seq);
    let recipient_hash = draft.recipient.hash();
    let dialog_id = DialogId::from_hashes(&identity.address_hash(), &recipient_hash);

    let frame = ClientFrame::DmMessage {
        sender: me.clone(),
        sender_hash: identity.address_hash(),
        recipient_hash,
        dialog_hash: dialog_id.clone(),
        ciphertext: ciphertext.clone(),
        ciphertext_self: Some(ciphertext_self.clone()),
        timestamp: now.timestamp_millis(),
        attachment_ref: draft.attachment_ref.clone(),
        temp_id: temp_id.clone(),
        reply_to: draft.reply_to.clone(),
    };

    let message = Message {
        id: temp_id,
        dialog_id,
        sender: me.clone(),
        recipient: Some(draft.recipient),
        ciphertext,
        ciphertext_self: Some(ciphertext_self),
        timestamp: now,
        status: MessageStatus::Pending,
        plaintext: Some(draft.text),
        reply_to: draft.reply_to,
        reply_preview: None,
        edited: false,
        edit_count: 0,
        reactions: Default::default(),
        attachment_ref: draft.attachment_ref,
        tx_id: None,
    };

    Ok(Prepared { message, frame })
}
