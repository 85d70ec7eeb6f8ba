//! Conversation model shared by the cache, the transport and the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::PREVIEW_CHARS;
use crate::types::{Address, DialogId, MessageId, MessageStatus};

/// Emoji -> set of reactor addresses.
pub type Reactions = BTreeMap<String, BTreeSet<String>>;

/// A message: immutable ciphertext plus mutable display state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Durable relay id, or a `temp_` id until the relay confirms the send.
    pub id: MessageId,
    pub dialog_id: DialogId,
    pub sender: Address,
    /// `None` for room messages.
    pub recipient: Option<Address>,
    pub ciphertext: String,
    /// Same plaintext sealed to the sender's own key.
    pub ciphertext_self: Option<String>,
    /// Logical send time; the only ordering key across sources.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Resolved display text. Cache-only.
    pub plaintext: Option<String>,
    pub reply_to: Option<MessageId>,
    /// Quoted text of `reply_to`, kept in step with edits and deletes.
    pub reply_preview: Option<String>,
    pub edited: bool,
    pub edit_count: u32,
    pub reactions: Reactions,
    /// Content address of an attachment.
    pub attachment_ref: Option<String>,
    /// Ledger transaction carrying this message, when there is one.
    pub tx_id: Option<String>,
}

impl Message {
    pub fn is_outbound(&self, me: &Address) -> bool {
        &self.sender == me
    }

    /// Recipient for outbound messages, sender for inbound ones.
    pub fn counterparty<'a>(&'a self, me: &Address) -> Option<&'a Address> {
        if self.is_outbound(me) {
            self.recipient.as_ref()
        } else {
            Some(&self.sender)
        }
    }

    /// True when both copies carry the same sealed payload. Display state
    /// (status, plaintext, edits, reactions) is not compared.
    pub fn same_payload(&self, other: &Message) -> bool {
        self.id == other.id
            && self.dialog_id == other.dialog_id
            && self.sender == other.sender
            && self.recipient == other.recipient
            && self.ciphertext == other.ciphertext
            && self.ciphertext_self == other.ciphertext_self
            && self.timestamp == other.timestamp
            && self.reply_to == other.reply_to
            && self.attachment_ref == other.attachment_ref
    }

    pub fn preview(&self) -> String {
        preview_text(self.plaintext.as_deref().unwrap_or_default())
    }
}

pub fn preview_text(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

/// Local projection of a counterparty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub address: Address,
    pub display_name: Option<String>,
    pub dialog_id: DialogId,
    pub last_preview: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub unread: u32,
    pub blocked: bool,
}

impl Contact {
    pub fn new(address: Address, dialog_id: DialogId) -> Self {
        Self {
            address,
            display_name: None,
            dialog_id,
            last_preview: None,
            last_timestamp: None,
            unread: 0,
            blocked: false,
        }
    }
}

/// Per-dialog disappearing-message setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DisappearingTimer {
    #[default]
    Off,
    After(Duration),
}

impl DisappearingTimer {
    pub fn ttl(self) -> Option<Duration> {
        match self {
            Self::Off => None,
            Self::After(ttl) => Some(ttl),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(PREVIEW_CHARS + 5);
        let preview = preview_text(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 1);
        assert!(preview.ends_with('…'));
        assert_eq!(preview_text("hi"), "hi");
    }

    #[test]
    fn test_same_payload_ignores_display_state() {
        let a = Message {
            id: MessageId::new("m1"),
            dialog_id: DialogId("d".into()),
            sender: Address::new("0xalice"),
            recipient: Some(Address::new("0xbob")),
            ciphertext: "ct".into(),
            ciphertext_self: None,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            plaintext: None,
            reply_to: None,
            reply_preview: None,
            edited: false,
            edit_count: 0,
            reactions: Reactions::new(),
            attachment_ref: None,
            tx_id: None,
        };
        let mut b = a.clone();
        b.status = MessageStatus::Read;
        b.plaintext = Some("hi".into());
        b.reactions.insert("+1".into(), BTreeSet::from(["0xbob".to_string()]));
        assert!(a.same_payload(&b));

        b.ciphertext = "other".into();
        assert!(!a.same_payload(&b));
    }
}
