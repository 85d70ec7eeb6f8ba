use serde::{Deserialize, Serialize};

use crate::constants::{ADDRESS_HASH_BYTES, ROOM_PREFIX, TEMP_ID_PREFIX, UNKNOWN_ADDRESSES};

// Wallet address. Stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder addresses the relay emits when a participant is unknown.
    pub fn is_unknown(&self) -> bool {
        UNKNOWN_ADDRESSES.contains(&self.0.as_str())
    }

    pub fn hash(&self) -> AddressHash {
        let digest = blake3::hash(self.0.as_bytes());
        AddressHash(hex::encode(&digest.as_bytes()[..ADDRESS_HASH_BYTES]))
    }

    pub fn short(&self) -> String {
        self.0.chars().take(10).collect()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AddressHash(pub String);

impl std::fmt::Display for AddressHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order-independent conversation key.
///
/// Direct dialogs are `min(hashA, hashB) + "_" + max(hashA, hashB)`; room
/// timelines reuse the same key space as `room:<room id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DialogId(pub String);

impl DialogId {
    pub fn between(a: &Address, b: &Address) -> Self {
        Self::from_hashes(&a.hash(), &b.hash())
    }

    pub fn from_hashes(a: &AddressHash, b: &AddressHash) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", lo.0, hi.0))
    }

    pub fn room(room_id: &str) -> Self {
        Self(format!("{ROOM_PREFIX}{room_id}"))
    }

    pub fn is_room(&self) -> bool {
        self.0.starts_with(ROOM_PREFIX)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.0.strip_prefix(ROOM_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn temporary(seq: u64) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{seq}"))
    }

    /// Client-generated id still waiting for the relay's durable id.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Confirmed,
    Failed,
    Included,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Failed => 1,
            Self::Sent => 2,
            Self::Confirmed => 3,
            Self::Included => 4,
            Self::Delivered => 5,
            Self::Read => 6,
        }
    }

    /// Combine a relay-reported status with the current one. Relay updates
    /// may arrive out of order, so the result never moves backwards.
    pub fn merge(self, incoming: Self) -> Self {
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Included => "included",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "confirmed" => Self::Confirmed,
            "failed" => Self::Failed,
            "included" => Self::Included,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_id_is_order_independent() {
        let alice = Address::new("0xAAAA1111");
        let bob = Address::new("0xbbbb2222");

        assert_eq!(DialogId::between(&alice, &bob), DialogId::between(&bob, &alice));

        let id = DialogId::between(&alice, &bob);
        let (lo, hi) = id.0.split_once('_').unwrap();
        assert!(lo <= hi);
    }

    #[test]
    fn test_address_is_case_insensitive() {
        assert_eq!(Address::new("0xABCD").hash(), Address::new("0xabcd").hash());
    }

    #[test]
    fn test_room_dialog_key() {
        let id = DialogId::room("general");
        assert!(id.is_room());
        assert_eq!(id.room_id(), Some("general"));
    }

    #[test]
    fn test_temporary_ids() {
        assert!(MessageId::temporary(1).is_temporary());
        assert!(!MessageId::new("msg_42").is_temporary());
    }

    #[test]
    fn test_status_merge_never_regresses() {
        assert_eq!(MessageStatus::Read.merge(MessageStatus::Sent), MessageStatus::Read);
        assert_eq!(MessageStatus::Pending.merge(MessageStatus::Sent), MessageStatus::Sent);
        assert_eq!(MessageStatus::Read.merge(MessageStatus::Read), MessageStatus::Read);
    }
}
