//! Reconciliation of messages arriving from the cache, the relay and the
//! ledger into one deduplicated timeline per dialog.

use std::collections::{HashMap, HashSet, VecDeque};

use sigil_shared::{Address, DialogId, Message, MessageId};
use tracing::debug;

use crate::inbox::Inbox;

/// Outcome of [`Reconciler::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; eligible for notification.
    New,
    /// Already admitted with the same payload; status merged at most.
    Duplicate,
    /// An existing entry changed: a temp id became durable, or the payload
    /// under a known id was replaced.
    Updated,
}

#[derive(Debug, Clone, Default)]
pub struct AdmitOptions {
    /// Offline catch-up or cache replay: never notify.
    pub silent: bool,
    /// The sender's temporary id, when the relay echoes it back.
    pub echo_of: Option<MessageId>,
}

impl AdmitOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            echo_of: None,
        }
    }
}

/// Insertion-ordered id set that forgets its oldest entries past `capacity`.
/// The cache stays the long-term record of what was seen.
#[derive(Debug)]
struct BoundedIdSet {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl BoundedIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: MessageId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &MessageId) {
        if self.ids.remove(id) {
            self.order.retain(|x| x != id);
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Result of a temp-id rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub dialog_id: DialogId,
    /// Ids whose stored copy changed, the durable id first.
    pub touched: Vec<MessageId>,
}

/// Where an outstanding temporary id was sent from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSend {
    dialog_id: DialogId,
    sender: Address,
}

/// Owns the admitted-id set and the outstanding temporary ids. Every
/// mutation goes through `&mut self`, so the session actor is its only writer.
#[derive(Debug)]
pub struct Reconciler {
    admitted: BoundedIdSet,
    pending: HashMap<MessageId, PendingSend>,
}

impl Reconciler {
    pub fn new(capacity: usize) -> Self {
        Self {
            admitted: BoundedIdSet::new(capacity),
            pending: HashMap::new(),
        }
    }

    pub fn is_admitted(&self, id: &MessageId) -> bool {
        self.admitted.contains(id)
    }

    pub fn admitted_len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_pending(&self, temp: &MessageId) -> bool {
        self.pending.contains_key(temp)
    }

    /// True when `candidate` is the relay's echo of the outstanding send
    /// `temp`. Temporary ids are only unique per sender, so the sender and
    /// the dialog must both match.
    pub fn is_echo_of(&self, temp: &MessageId, candidate: &Message) -> bool {
        temp != &candidate.id
            && self.pending.get(temp).is_some_and(|p| {
                p.sender == candidate.sender && p.dialog_id == candidate.dialog_id
            })
    }

    /// Decide whether `candidate` is new, a duplicate or an update, and
    /// merge it into `inbox` accordingly.
    pub fn admit(&mut self, inbox: &mut Inbox, candidate: Message, opts: &AdmitOptions) -> Admission {
        if let Some(temp) = opts.echo_of.as_ref() {
            if self.is_echo_of(temp, &candidate) {
                let id = candidate.id.clone();
                let status = candidate.status;
                if self.rename(inbox, temp, &id).is_some() {
                    if let Some(timeline) = inbox.existing_mut(&candidate.dialog_id) {
                        timeline.merge_status(&id, status);
                    }
                    return Admission::Updated;
                }
            }
        }

        let timeline = inbox.timeline_mut(&candidate.dialog_id);
        let existing = timeline.get(&candidate.id).cloned();

        match existing {
            Some(existing) if existing.same_payload(&candidate) => {
                timeline.merge_status(&candidate.id, candidate.status);
                if existing.tx_id.is_none() && candidate.tx_id.is_some() {
                    let mut filled = existing;
                    filled.status = filled.status.merge(candidate.status);
                    filled.tx_id = candidate.tx_id;
                    timeline.replace(filled);
                }
                self.admitted.insert(candidate.id);
                Admission::Duplicate
            }
            Some(existing) => {
                // Same id, different payload: keep display overlays.
                let mut merged = candidate;
                merged.status = existing.status.merge(merged.status);
                merged.reactions = existing.reactions;
                merged.edited = existing.edited || merged.edited;
                merged.edit_count = existing.edit_count.max(merged.edit_count);
                if merged.plaintext.is_none() {
                    merged.plaintext = existing.plaintext;
                }
                if merged.tx_id.is_none() {
                    merged.tx_id = existing.tx_id;
                }
                timeline.replace(merged);
                Admission::Updated
            }
            None if self.admitted.contains(&candidate.id) => {
                // Seen before but no longer shown (deleted or expired).
                debug!(id = %candidate.id, "admitted id re-delivered, ignored");
                Admission::Duplicate
            }
            None => {
                if candidate.id.is_temporary() {
                    self.pending.insert(
                        candidate.id.clone(),
                        PendingSend {
                            dialog_id: candidate.dialog_id.clone(),
                            sender: candidate.sender.clone(),
                        },
                    );
                }
                self.admitted.insert(candidate.id.clone());
                timeline.insert(candidate);
                Admission::New
            }
        }
    }

    /// Mark history read back from the cache as seen, without notifying.
    /// The caller merges the page into its timeline.
    pub fn note_loaded(&mut self, dialog_id: &DialogId, page: &[Message]) {
        for m in page {
            self.admitted.insert(m.id.clone());
            if m.id.is_temporary() {
                self.pending.insert(
                    m.id.clone(),
                    PendingSend {
                        dialog_id: dialog_id.clone(),
                        sender: m.sender.clone(),
                    },
                );
            }
        }
    }

    /// Replace `temp` by `durable` everywhere in its timeline. Returns
    /// `None` when `temp` is not an outstanding temporary id.
    pub fn rename(&mut self, inbox: &mut Inbox, temp: &MessageId, durable: &MessageId) -> Option<Renamed> {
        let dialog_id = self.pending.remove(temp)?.dialog_id;
        let touched = inbox
            .existing_mut(&dialog_id)
            .map(|t| t.rename(temp, durable))
            .unwrap_or_default();
        self.admitted.remove(temp);
        self.admitted.insert(durable.clone());
        if touched.is_empty() {
            debug!(temp = %temp, durable = %durable, "temp id no longer in a timeline");
        }
        Some(Renamed { dialog_id, touched })
    }

    /// The dialog an outstanding temporary id was sent to.
    pub fn pending_dialog(&self, temp: &MessageId) -> Option<&DialogId> {
        self.pending.get(temp).map(|p| &p.dialog_id)
    }

    /// Forget a temporary id whose send was abandoned.
    pub fn forget(&mut self, id: &MessageId) {
        self.pending.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use sigil_shared::MessageStatus;

    use super::*;

    fn msg(id: &str, ts: i64) -> Message {
        Message {
            id: MessageId::new(id),
            dialog_id: DialogId("d".into()),
            sender: Address::new("0xalice"),
            recipient: Some(Address::new("0xbob")),
            ciphertext: "nonce.body".into(),
            ciphertext_self: None,
            timestamp: Utc.timestamp_millis_opt(ts).unwrap(),
            status: MessageStatus::Sent,
            plaintext: Some("hi".into()),
            reply_to: None,
            reply_preview: None,
            edited: false,
            edit_count: 0,
            reactions: Default::default(),
            attachment_ref: None,
            tx_id: None,
        }
    }

    fn ids(inbox: &Inbox) -> Vec<String> {
        inbox
            .timeline(&DialogId("d".into()))
            .map(|t| t.messages().iter().map(|m| m.id.0.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_same_id_twice_is_one_entry() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let opts = AdmitOptions::default();

        assert_eq!(r.admit(&mut inbox, msg("m1", 10), &opts), Admission::New);
        assert_eq!(r.admit(&mut inbox, msg("m1", 10), &opts), Admission::Duplicate);
        assert_eq!(ids(&inbox), vec!["m1"]);
    }

    #[test]
    fn test_duplicate_merges_status_only() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let opts = AdmitOptions::default();
        r.admit(&mut inbox, msg("m1", 10), &opts);

        let mut confirmed = msg("m1", 10);
        confirmed.status = MessageStatus::Confirmed;
        confirmed.plaintext = None;
        assert_eq!(r.admit(&mut inbox, confirmed, &opts), Admission::Duplicate);

        let stored = inbox.find(&DialogId("d".into()), &MessageId::new("m1")).unwrap();
        assert_eq!(stored.status, MessageStatus::Confirmed);
        assert_eq!(stored.plaintext.as_deref(), Some("hi"));

        // A late, lower status does not regress it.
        r.admit(&mut inbox, msg("m1", 10), &opts);
        let stored = inbox.find(&DialogId("d".into()), &MessageId::new("m1")).unwrap();
        assert_eq!(stored.status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let opts = AdmitOptions::default();
        r.admit(&mut inbox, msg("late", 30), &opts);
        r.admit(&mut inbox, msg("early", 10), &opts);
        r.admit(&mut inbox, msg("mid", 20), &opts);
        assert_eq!(ids(&inbox), vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_echo_with_temp_id_is_an_update() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let mut local = msg("temp_1", 10);
        local.status = MessageStatus::Pending;
        assert_eq!(r.admit(&mut inbox, local, &AdmitOptions::default()), Admission::New);
        assert!(r.is_pending(&MessageId::new("temp_1")));

        let mut echo = msg("msg_42", 10);
        echo.plaintext = None;
        let opts = AdmitOptions {
            silent: false,
            echo_of: Some(MessageId::new("temp_1")),
        };
        assert_eq!(r.admit(&mut inbox, echo, &opts), Admission::Updated);
        assert_eq!(ids(&inbox), vec!["msg_42"]);
        assert!(!r.is_pending(&MessageId::new("temp_1")));
        assert!(r.is_admitted(&MessageId::new("msg_42")));

        let stored = inbox.find(&DialogId("d".into()), &MessageId::new("msg_42")).unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.plaintext.as_deref(), Some("hi"));
    }

    #[test]
    fn test_foreign_temp_id_is_not_an_echo() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let mut local = msg("temp_1", 10);
        local.status = MessageStatus::Pending;
        r.admit(&mut inbox, local, &AdmitOptions::default());

        // Another sender numbered their own send temp_1 too.
        let mut foreign = msg("msg_42", 20);
        foreign.sender = Address::new("0xcarol");
        let opts = AdmitOptions {
            silent: false,
            echo_of: Some(MessageId::new("temp_1")),
        };
        assert_eq!(r.admit(&mut inbox, foreign, &opts), Admission::New);
        assert_eq!(ids(&inbox), vec!["temp_1", "msg_42"]);
        assert!(r.is_pending(&MessageId::new("temp_1")));

        // Same sender, other dialog: not ours either.
        let mut elsewhere = msg("msg_43", 30);
        elsewhere.dialog_id = DialogId("e".into());
        assert!(!r.is_echo_of(&MessageId::new("temp_1"), &elsewhere));
        assert_eq!(r.admit(&mut inbox, elsewhere, &opts), Admission::New);
        assert!(r.is_pending(&MessageId::new("temp_1")));
        assert_eq!(
            r.pending_dialog(&MessageId::new("temp_1")),
            Some(&DialogId("d".into()))
        );
    }

    #[test]
    fn test_rename_happens_once() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        r.admit(&mut inbox, msg("temp_1", 10), &AdmitOptions::default());

        let temp = MessageId::new("temp_1");
        let durable = MessageId::new("msg_42");
        let renamed = r.rename(&mut inbox, &temp, &durable).unwrap();
        assert_eq!(renamed.dialog_id, DialogId("d".into()));
        assert!(r.rename(&mut inbox, &temp, &durable).is_none());
        assert_eq!(ids(&inbox), vec!["msg_42"]);
    }

    #[test]
    fn test_changed_payload_keeps_overlays() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let opts = AdmitOptions::default();
        r.admit(&mut inbox, msg("m1", 10), &opts);
        let dialog = DialogId("d".into());
        let mut reactions = sigil_shared::Reactions::new();
        reactions.entry("👍".into()).or_default().insert("0xbob".into());
        inbox
            .timeline_mut(&dialog)
            .set_reactions(&MessageId::new("m1"), reactions.clone());

        let mut changed = msg("m1", 10);
        changed.ciphertext = "other.cipher".into();
        assert_eq!(r.admit(&mut inbox, changed, &opts), Admission::Updated);
        let stored = inbox.find(&dialog, &MessageId::new("m1")).unwrap();
        assert_eq!(stored.ciphertext, "other.cipher");
        assert_eq!(stored.reactions, reactions);
    }

    #[test]
    fn test_removed_message_is_not_resurrected() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let opts = AdmitOptions::default();
        r.admit(&mut inbox, msg("m1", 10), &opts);
        inbox
            .timeline_mut(&DialogId("d".into()))
            .remove(&MessageId::new("m1"));

        assert_eq!(r.admit(&mut inbox, msg("m1", 10), &opts), Admission::Duplicate);
        assert!(ids(&inbox).is_empty());
    }

    #[test]
    fn test_admitted_set_is_bounded() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(3);
        let opts = AdmitOptions::default();
        for i in 0..5 {
            r.admit(&mut inbox, msg(&format!("m{i}"), i), &opts);
        }
        assert_eq!(r.admitted_len(), 3);
        assert!(!r.is_admitted(&MessageId::new("m0")));
        assert!(r.is_admitted(&MessageId::new("m4")));
        // Still deduplicated by the timeline itself.
        assert_eq!(r.admit(&mut inbox, msg("m0", 0), &opts), Admission::Duplicate);
    }

    #[test]
    fn test_loaded_history_counts_as_admitted() {
        let mut inbox = Inbox::new();
        let mut r = Reconciler::new(100);
        let dialog = DialogId("d".into());
        let page = vec![msg("a", 1), msg("temp_7", 2)];
        r.note_loaded(&dialog, &page);
        inbox.timeline_mut(&dialog).merge_page(page);

        assert_eq!(
            r.admit(&mut inbox, msg("a", 1), &AdmitOptions::default()),
            Admission::Duplicate
        );
        // A send that never got its durable id can still be confirmed.
        assert!(r.is_pending(&MessageId::new("temp_7")));
    }
}
