//! Relay wire protocol: one JSON object per WebSocket text frame, tagged by
//! its `type` field.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::Reactions;
use crate::types::{Address, AddressHash, DialogId, MessageId, MessageStatus};

/// Frames sent by this client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    /// Auth handshake, sent first on every (re)connect
    Subscribe {
        identity: Address,
        identity_hash: AddressHash,
    },

    DmMessage {
        sender: Address,
        sender_hash: AddressHash,
        recipient_hash: AddressHash,
        dialog_hash: DialogId,
        ciphertext: String,
        ciphertext_self: Option<String>,
        /// Unix millis
        timestamp: i64,
        attachment_ref: Option<String>,
        temp_id: MessageId,
        reply_to: Option<MessageId>,
    },

    Typing {
        dialog_hash: DialogId,
    },

    Heartbeat {},

    SubscribeRoom {
        room_id: String,
    },

    RoomMessage {
        room_id: String,
        sender: Address,
        content: String,
        timestamp: i64,
        temp_id: MessageId,
        reply_to: Option<MessageId>,
    },

    RoomTyping {
        room_id: String,
    },

    ReadReceipt {
        dialog_hash: DialogId,
        message_ids: Vec<MessageId>,
        reader: Address,
    },
}

/// Message payload carried by `message_detected` and `tx_confirmed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    pub dialog_hash: DialogId,
    pub sender: Address,
    #[serde(default)]
    pub recipient: Option<Address>,
    pub ciphertext: String,
    #[serde(default)]
    pub ciphertext_self: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub attachment_ref: Option<String>,
    #[serde(default)]
    pub tx_id: Option<String>,
    /// The sender's temporary id, echoed back to the sender
    #[serde(default)]
    pub temp_id: Option<MessageId>,
    /// Delivered during offline catch-up
    #[serde(default)]
    pub catch_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomWireMessage {
    pub id: MessageId,
    pub room_id: String,
    pub sender: Address,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub temp_id: Option<MessageId>,
    #[serde(default)]
    pub catch_up: bool,
}

/// Events pushed by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MessageDetected(WireMessage),

    TxConfirmed(WireMessage),

    MessageDeleted {
        id: MessageId,
        dialog_hash: DialogId,
    },

    MessageUpdated {
        id: MessageId,
        dialog_hash: DialogId,
        ciphertext: String,
        #[serde(default)]
        ciphertext_self: Option<String>,
        #[serde(default)]
        edit_count: u32,
    },

    ReactionUpdate {
        message_id: MessageId,
        dialog_hash: DialogId,
        reactions: Reactions,
    },

    DmSent {
        temp_id: MessageId,
        durable_id: MessageId,
        dialog_hash: DialogId,
    },

    DmCleared {
        dialog_hash: DialogId,
    },

    RoomMessage(RoomWireMessage),

    RoomCreated {
        room_id: String,
        #[serde(default)]
        name: Option<String>,
    },

    RoomDeleted {
        room_id: String,
    },

    PinUpdate {
        dialog_hash: DialogId,
        #[serde(default)]
        message_id: Option<MessageId>,
    },

    ProfileDetected {
        address: Address,
    },

    ReadReceipt {
        dialog_hash: DialogId,
        message_ids: Vec<MessageId>,
        reader: Address,
    },

    Typing {
        dialog_hash: DialogId,
        sender: Address,
    },

    RoomTyping {
        room_id: String,
        sender: Address,
    },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
