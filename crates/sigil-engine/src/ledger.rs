//! Read-only view of the ledger, used to settle transaction-backed messages.

use async_trait::async_trait;
use sigil_shared::MessageStatus;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Not final yet; ask again later.
    Pending,
    Accepted,
    Rejected,
}

impl TxOutcome {
    /// Terminal message status for this outcome, if any.
    pub fn status(self) -> Option<MessageStatus> {
        match self {
            Self::Pending => None,
            Self::Accepted => Some(MessageStatus::Included),
            Self::Rejected => Some(MessageStatus::Failed),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn tx_outcome(&self, tx_id: &str) -> Result<TxOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(TxOutcome::Pending.status(), None);
        assert_eq!(TxOutcome::Accepted.status(), Some(MessageStatus::Included));
        assert_eq!(TxOutcome::Rejected.status(), Some(MessageStatus::Failed));
    }
}
