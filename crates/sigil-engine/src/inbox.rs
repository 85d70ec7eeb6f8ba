//! Per-dialog timelines.
//!
//! A [`Timeline`] keeps its messages sorted by `(timestamp, id)` at all
//! times; every mutation that can move a message re-inserts it at its
//! sorted position. Overlays (edits, deletes, reactions, receipts) are
//! applied by id and keep reply previews in step.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sigil_shared::constants::DELETED_PREVIEW;
use sigil_shared::model::preview_text;
use sigil_shared::{Address, DialogId, DisappearingTimer, Message, MessageId, MessageStatus, Reactions};

/// History load progress for one timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Loaded,
}

#[derive(Debug, Clone)]
pub struct Timeline {
    dialog_id: DialogId,
    state: LoadState,
    loading_older: bool,
    /// The cache returned a short page; there is nothing older.
    exhausted: bool,
    messages: Vec<Message>,
    pinned: Option<MessageId>,
    timer: DisappearingTimer,
}

impl Timeline {
    pub fn new(dialog_id: DialogId) -> Self {
        Self {
            dialog_id,
            state: LoadState::Empty,
            loading_older: false,
            exhausted: false,
            messages: Vec::new(),
            pinned: None,
            timer: DisappearingTimer::Off,
        }
    }

    pub fn dialog_id(&self) -> &DialogId {
        &self.dialog_id
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pinned(&self) -> Option<&MessageId> {
        self.pinned.as_ref()
    }

    pub fn set_pinned(&mut self, id: Option<MessageId>) {
        self.pinned = id;
    }

    pub fn timer(&self) -> DisappearingTimer {
        self.timer
    }

    pub fn set_timer(&mut self, timer: DisappearingTimer) {
        self.timer = timer;
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Insert at the sorted position. An id that is already present is
    /// left untouched and `false` is returned.
    pub fn insert(&mut self, mut message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        if let Some(target) = message.reply_to.as_ref() {
            if message.reply_preview.is_none() {
                message.reply_preview = self.get(target).map(Message::preview);
            }
        }
        self.insert_sorted(message);
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = (message.timestamp, &message.id);
        let at = self
            .messages
            .partition_point(|m| (m.timestamp, &m.id) <= key);
        self.messages.insert(at, message);
    }

    /// Merge a page of history; present ids are never replaced. Returns
    /// how many messages were added.
    pub fn merge_page(&mut self, page: Vec<Message>) -> usize {
        let mut added = 0;
        for message in page {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Replace a message wholesale, re-sorting if its timestamp moved.
    pub fn replace(&mut self, message: Message) {
        if let Some(i) = self.position(&message.id) {
            self.messages.remove(i);
        }
        self.insert_sorted(message);
    }

    /// Merge a relay-driven status; never regresses. Returns whether it changed.
    pub fn merge_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        let message = &mut self.messages[i];
        let merged = message.status.merge(status);
        let changed = merged != message.status;
        message.status = merged;
        changed
    }

    /// Set a status outright, as the ledger does for terminal outcomes.
    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        let changed = self.messages[i].status != status;
        self.messages[i].status = status;
        changed
    }

    /// Swap a temporary id for its durable one and point replies at it. If
    /// the durable id is already present the temporary entry is folded into
    /// it. Returns the ids of every message that changed.
    pub fn rename(&mut self, temp: &MessageId, durable: &MessageId) -> Vec<MessageId> {
        let Some(i) = self.position(temp) else {
            return Vec::new();
        };
        let mut message = self.messages.remove(i);
        let mut changed = vec![durable.clone()];

        if let Some(j) = self.position(durable) {
            let existing = &mut self.messages[j];
            existing.status = existing.status.merge(message.status);
            if existing.plaintext.is_none() {
                existing.plaintext = message.plaintext.take();
            }
        } else {
            message.id = durable.clone();
            self.insert_sorted(message);
        }

        for m in self.messages.iter_mut() {
            if m.reply_to.as_ref() == Some(temp) {
                m.reply_to = Some(durable.clone());
                changed.push(m.id.clone());
            }
        }
        if self.pinned.as_ref() == Some(temp) {
            self.pinned = Some(durable.clone());
        }
        changed
    }

    /// Remove a message; replies quoting it are tombstoned. Returns the
    /// removed message and the ids of the tombstoned replies.
    pub fn remove(&mut self, id: &MessageId) -> Option<(Message, Vec<MessageId>)> {
        let i = self.position(id)?;
        let removed = self.messages.remove(i);
        let mut touched = Vec::new();
        for m in self.messages.iter_mut() {
            if m.reply_to.as_ref() == Some(id) {
                m.reply_preview = Some(DELETED_PREVIEW.to_string());
                touched.push(m.id.clone());
            }
        }
        if self.pinned.as_ref() == Some(id) {
            self.pinned = None;
        }
        Some((removed, touched))
    }

    /// Apply an edit and refresh the quoted text of its replies. Returns
    /// the ids of every message that changed, the edited one first.
    pub fn apply_edit(
        &mut self,
        id: &MessageId,
        ciphertext: String,
        ciphertext_self: Option<String>,
        plaintext: String,
        edit_count: u32,
    ) -> Vec<MessageId> {
        let Some(i) = self.position(id) else {
            return Vec::new();
        };
        let preview = preview_text(&plaintext);
        let message = &mut self.messages[i];
        message.ciphertext = ciphertext;
        message.ciphertext_self = ciphertext_self;
        message.plaintext = Some(plaintext);
        message.edited = true;
        message.edit_count = edit_count.max(message.edit_count.saturating_add(1));

        let mut touched = vec![id.clone()];
        for m in self.messages.iter_mut() {
            if m.reply_to.as_ref() == Some(id) {
                m.reply_preview = Some(preview.clone());
                touched.push(m.id.clone());
            }
        }
        touched
    }

    pub fn set_reactions(&mut self, id: &MessageId, reactions: Reactions) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        self.messages[i].reactions = reactions;
        true
    }

    /// Flip our own outbound messages among `ids` to `read`. Idempotent:
    /// returns only the ids whose status actually changed.
    pub fn mark_read(&mut self, ids: &[MessageId], me: &Address) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for m in self.messages.iter_mut() {
            if m.sender != *me || !ids.contains(&m.id) {
                continue;
            }
            let merged = m.status.merge(MessageStatus::Read);
            if merged != m.status {
                m.status = merged;
                changed.push(m.id.clone());
            }
        }
        changed
    }

    /// Drop every message older than the timer's TTL. A timer of `Off`
    /// keeps everything.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<MessageId> {
        let Some(ttl) = self.timer.ttl() else {
            return Vec::new();
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        self.messages.retain(|m| {
            let keep = now.signed_duration_since(m.timestamp) <= ttl;
            if !keep {
                expired.push(m.id.clone());
            }
            keep
        });
        if self.pinned.as_ref().is_some_and(|p| expired.contains(p)) {
            self.pinned = None;
        }
        expired
    }

    pub fn clear(&mut self) -> Vec<MessageId> {
        self.pinned = None;
        self.messages.drain(..).map(|m| m.id).collect()
    }

    /// `Empty -> Loading`. Returns `false` if a load already ran or is running.
    pub fn begin_load(&mut self) -> bool {
        if self.state != LoadState::Empty {
            return false;
        }
        self.state = LoadState::Loading;
        true
    }

    /// `Loading -> Loaded`, merging the first page.
    pub fn finish_load(&mut self, page: Vec<Message>, requested: usize) -> usize {
        self.exhausted = page.len() < requested;
        let added = self.merge_page(page);
        self.state = LoadState::Loaded;
        added
    }

    /// A failed first load goes back to `Empty` so it can be retried.
    pub fn abort_load(&mut self) {
        if self.state == LoadState::Loading {
            self.state = LoadState::Empty;
        }
    }

    /// Enter the `loading_older` sub-state. Only valid once loaded, and
    /// only one backward page at a time.
    pub fn begin_older(&mut self) -> bool {
        if self.state != LoadState::Loaded || self.loading_older || self.exhausted {
            return false;
        }
        self.loading_older = true;
        true
    }

    pub fn finish_older(&mut self, page: Vec<Message>, requested: usize) -> usize {
        self.loading_older = false;
        if page.len() < requested {
            self.exhausted = true;
        }
        self.merge_page(page)
    }

    pub fn abort_older(&mut self) {
        self.loading_older = false;
    }
}

/// All timelines of the session plus the dialog the user is looking at.
#[derive(Debug, Default)]
pub struct Inbox {
    timelines: HashMap<DialogId, Timeline>,
    active: Option<DialogId>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self, dialog_id: &DialogId) -> Option<&Timeline> {
        self.timelines.get(dialog_id)
    }

    /// Get or create.
    pub fn timeline_mut(&mut self, dialog_id: &DialogId) -> &mut Timeline {
        self.timelines
            .entry(dialog_id.clone())
            .or_insert_with(|| Timeline::new(dialog_id.clone()))
    }

    pub fn existing_mut(&mut self, dialog_id: &DialogId) -> Option<&mut Timeline> {
        self.timelines.get_mut(dialog_id)
    }

    pub fn remove_timeline(&mut self, dialog_id: &DialogId) -> Option<Timeline> {
        if self.active.as_ref() == Some(dialog_id) {
            self.active = None;
        }
        self.timelines.remove(dialog_id)
    }

    pub fn find(&self, dialog_id: &DialogId, id: &MessageId) -> Option<&Message> {
        self.timelines.get(dialog_id)?.get(id)
    }

    pub fn set_active(&mut self, dialog_id: Option<DialogId>) {
        self.active = dialog_id;
    }

    pub fn is_active(&self, dialog_id: &DialogId) -> bool {
        self.active.as_ref() == Some(dialog_id)
    }

    /// Run the TTL sweep over every timeline.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<(DialogId, MessageId)> {
        let mut expired = Vec::new();
        for timeline in self.timelines.values_mut() {
            for id in timeline.sweep(now) {
                expired.push((timeline.dialog_id.clone(), id));
            }
        }
        expired
    }

    /// Outbound messages with a ledger transaction still awaiting a terminal state.
    pub fn pending_transactions(&self) -> Vec<(DialogId, MessageId, String)> {
        self.timelines
            .values()
            .flat_map(|t| t.messages.iter())
            .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Confirmed))
            .filter_map(|m| {
                m.tx_id
                    .as_ref()
                    .map(|tx| (m.dialog_id.clone(), m.id.clone(), tx.clone()))
            })
            .collect()
    }
}

/// Timer from whole seconds; `0` turns it off.
pub fn ttl_secs(secs: u64) -> DisappearingTimer {
    if secs == 0 {
        DisappearingTimer::Off
    } else {
        DisappearingTimer::After(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn msg(id: &str, ts: i64) -> Message {
        Message {
            id: MessageId::new(id),
            dialog_id: DialogId("d".into()),
            sender: Address::new("0xalice"),
            recipient: Some(Address::new("0xbob")),
            ciphertext: format!("ct-{id}"),
            ciphertext_self: None,
            timestamp: Utc.timestamp_millis_opt(ts).unwrap(),
            status: MessageStatus::Sent,
            plaintext: Some(format!("text {id}")),
            reply_to: None,
            reply_preview: None,
            edited: false,
            edit_count: 0,
            reactions: Default::default(),
            attachment_ref: None,
            tx_id: None,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<&str> {
        timeline.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_insert_keeps_timestamp_order() {
        let mut t = Timeline::new(DialogId("d".into()));
        assert!(t.insert(msg("c", 300)));
        assert!(t.insert(msg("a", 100)));
        assert!(t.insert(msg("b", 200)));
        assert!(t.insert(msg("b2", 200)));
        assert!(!t.insert(msg("a", 999)));
        assert_eq!(ids(&t), vec!["a", "b", "b2", "c"]);
    }

    #[test]
    fn test_merge_page_never_replaces() {
        let mut t = Timeline::new(DialogId("d".into()));
        let mut live = msg("m2", 200);
        live.status = MessageStatus::Read;
        t.insert(live);

        let added = t.merge_page(vec![msg("m1", 100), msg("m2", 200), msg("m0", 50)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&t), vec!["m0", "m1", "m2"]);
        assert_eq!(t.get(&MessageId::new("m2")).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_rename_rewrites_replies_and_pin() {
        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(msg("temp_1", 100));
        let mut reply = msg("r", 200);
        reply.reply_to = Some(MessageId::new("temp_1"));
        t.insert(reply);
        t.set_pinned(Some(MessageId::new("temp_1")));

        let changed = t.rename(&MessageId::new("temp_1"), &MessageId::new("msg_42"));
        assert_eq!(changed, vec![MessageId::new("msg_42"), MessageId::new("r")]);
        assert!(!t.contains(&MessageId::new("temp_1")));
        assert_eq!(
            t.get(&MessageId::new("r")).unwrap().reply_to,
            Some(MessageId::new("msg_42"))
        );
        assert_eq!(t.pinned(), Some(&MessageId::new("msg_42")));
    }

    #[test]
    fn test_rename_folds_into_existing_durable() {
        let mut t = Timeline::new(DialogId("d".into()));
        let mut echo = msg("msg_42", 100);
        echo.plaintext = None;
        echo.status = MessageStatus::Delivered;
        t.insert(echo);
        t.insert(msg("temp_1", 100));

        t.rename(&MessageId::new("temp_1"), &MessageId::new("msg_42"));
        assert_eq!(t.len(), 1);
        let merged = t.get(&MessageId::new("msg_42")).unwrap();
        assert_eq!(merged.status, MessageStatus::Delivered);
        assert_eq!(merged.plaintext.as_deref(), Some("text temp_1"));
    }

    #[test]
    fn test_remove_tombstones_replies() {
        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(msg("a", 100));
        let mut reply = msg("b", 200);
        reply.reply_to = Some(MessageId::new("a"));
        t.insert(reply);
        assert_eq!(
            t.get(&MessageId::new("b")).unwrap().reply_preview.as_deref(),
            Some("text a")
        );

        let (removed, touched) = t.remove(&MessageId::new("a")).unwrap();
        assert_eq!(removed.id.as_str(), "a");
        assert_eq!(touched, vec![MessageId::new("b")]);
        assert_eq!(
            t.get(&MessageId::new("b")).unwrap().reply_preview.as_deref(),
            Some(DELETED_PREVIEW)
        );
        assert!(t.remove(&MessageId::new("a")).is_none());
    }

    #[test]
    fn test_edit_updates_reply_previews() {
        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(msg("a", 100));
        let mut reply = msg("b", 200);
        reply.reply_to = Some(MessageId::new("a"));
        t.insert(reply);

        let touched = t.apply_edit(&MessageId::new("a"), "ct2".into(), None, "fixed".into(), 1);
        assert_eq!(touched.len(), 2);
        let edited = t.get(&MessageId::new("a")).unwrap();
        assert!(edited.edited);
        assert_eq!(edited.edit_count, 1);
        assert_eq!(edited.plaintext.as_deref(), Some("fixed"));
        assert_eq!(
            t.get(&MessageId::new("b")).unwrap().reply_preview.as_deref(),
            Some("fixed")
        );
    }

    #[test]
    fn test_edit_count_saturates() {
        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(msg("a", 100));
        let id = MessageId::new("a");

        t.apply_edit(&id, "ct2".into(), None, "one".into(), u32::MAX);
        t.apply_edit(&id, "ct3".into(), None, "two".into(), 0);
        let edited = t.get(&id).unwrap();
        assert_eq!(edited.edit_count, u32::MAX);
        assert_eq!(edited.plaintext.as_deref(), Some("two"));
    }

    #[test]
    fn test_mark_read_only_touches_own_messages_once() {
        let me = Address::new("0xalice");
        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(msg("mine", 100));
        let mut theirs = msg("theirs", 200);
        theirs.sender = Address::new("0xbob");
        t.insert(theirs);

        let wanted = [MessageId::new("mine"), MessageId::new("theirs")];
        assert_eq!(t.mark_read(&wanted, &me), vec![MessageId::new("mine")]);
        assert!(t.mark_read(&wanted, &me).is_empty());
        assert_eq!(
            t.get(&MessageId::new("theirs")).unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_sweep_respects_timer() {
        let now = Utc::now();
        let ttl = 60;
        let mut old = msg("old", 0);
        old.timestamp = now - chrono::Duration::seconds(ttl + 1);
        let mut fresh = msg("fresh", 0);
        fresh.timestamp = now - chrono::Duration::seconds(5);

        let mut t = Timeline::new(DialogId("d".into()));
        t.insert(old);
        t.insert(fresh);

        assert!(t.sweep(now).is_empty());
        assert_eq!(t.len(), 2);

        t.set_timer(ttl_secs(ttl as u64));
        assert_eq!(t.sweep(now), vec![MessageId::new("old")]);
        assert_eq!(ids(&t), vec!["fresh"]);
    }

    #[test]
    fn test_load_states() {
        let mut t = Timeline::new(DialogId("d".into()));
        assert!(!t.begin_older());
        assert!(t.begin_load());
        assert!(!t.begin_load());
        assert_eq!(t.state(), LoadState::Loading);

        t.finish_load(vec![msg("b", 200), msg("c", 300)], 2);
        assert_eq!(t.state(), LoadState::Loaded);

        assert!(t.begin_older());
        assert!(!t.begin_older());
        assert_eq!(t.finish_older(vec![msg("a", 100)], 2), 1);
        assert!(t.is_exhausted());
        assert!(!t.begin_older());
        assert_eq!(ids(&t), vec!["a", "b", "c"]);
    }
}
