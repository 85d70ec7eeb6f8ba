//! Contact book: one entry per counterparty, created lazily the first time
//! a message to or from the address is seen.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sigil_shared::{Address, Contact, DialogId};

#[derive(Debug, Default)]
pub struct ContactBook {
    contacts: HashMap<Address, Contact>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the cache.
    pub fn load(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            self.contacts.insert(contact.address.clone(), contact);
        }
    }

    pub fn get(&self, address: &Address) -> Option<&Contact> {
        self.contacts.get(address)
    }

    pub fn by_dialog(&self, dialog_id: &DialogId) -> Option<&Contact> {
        self.contacts.values().find(|c| &c.dialog_id == dialog_id)
    }

    fn entry(&mut self, address: &Address, dialog_id: &DialogId) -> &mut Contact {
        self.contacts
            .entry(address.clone())
            .or_insert_with(|| Contact::new(address.clone(), dialog_id.clone()))
    }

    /// Create the contact if needed and move its preview forward. Older
    /// messages never overwrite a newer preview.
    pub fn observe(
        &mut self,
        address: &Address,
        dialog_id: &DialogId,
        preview: String,
        timestamp: DateTime<Utc>,
    ) -> &Contact {
        let contact = self.entry(address, dialog_id);
        if contact.last_timestamp.map_or(true, |last| timestamp >= last) {
            contact.last_preview = Some(preview);
            contact.last_timestamp = Some(timestamp);
        }
        contact
    }

    pub fn increment_unread(&mut self, address: &Address) -> Option<&Contact> {
        let contact = self.contacts.get_mut(address)?;
        contact.unread = contact.unread.saturating_add(1);
        Some(contact)
    }

    /// Returns the contact if its counter was non-zero.
    pub fn clear_unread(&mut self, dialog_id: &DialogId) -> Option<&Contact> {
        let contact = self
            .contacts
            .values_mut()
            .find(|c| &c.dialog_id == dialog_id && c.unread > 0)?;
        contact.unread = 0;
        Some(contact)
    }

    /// Returns `Some` only when the display name changed.
    pub fn set_display_name(&mut self, address: &Address, name: String) -> Option<&Contact> {
        let contact = self.contacts.get_mut(address)?;
        if contact.display_name.as_deref() == Some(name.as_str()) {
            return None;
        }
        contact.display_name = Some(name);
        Some(contact)
    }

    pub fn set_blocked(&mut self, address: &Address, dialog_id: &DialogId, blocked: bool) -> &Contact {
        let contact = self.entry(address, dialog_id);
        contact.blocked = blocked;
        contact
    }

    /// Drop the entry. A later message recreates it from scratch.
    pub fn remove(&mut self, address: &Address) -> Option<Contact> {
        self.contacts.remove(address)
    }

    pub fn is_blocked(&self, address: &Address) -> bool {
        self.contacts.get(address).is_some_and(|c| c.blocked)
    }

    /// Most recent conversation first; never-messaged contacts last.
    pub fn all(&self) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts.values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then_with(|| a.address.cmp(&b.address))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_observe_creates_and_keeps_newest_preview() {
        let mut book = ContactBook::new();
        let bob = Address::new("0xbob");
        let dialog = DialogId("d".into());

        book.observe(&bob, &dialog, "second".into(), ts(200));
        book.observe(&bob, &dialog, "first".into(), ts(100));
        let contact = book.get(&bob).unwrap();
        assert_eq!(contact.last_preview.as_deref(), Some("second"));
        assert_eq!(contact.unread, 0);
    }

    #[test]
    fn test_unread_counters() {
        let mut book = ContactBook::new();
        let bob = Address::new("0xbob");
        let dialog = DialogId("d".into());

        assert!(book.increment_unread(&bob).is_none());
        book.observe(&bob, &dialog, "hi".into(), ts(1));
        book.increment_unread(&bob);
        book.increment_unread(&bob);
        assert_eq!(book.get(&bob).unwrap().unread, 2);
        assert!(book.clear_unread(&dialog).is_some());
        assert!(book.clear_unread(&dialog).is_none());
    }

    #[test]
    fn test_blocking_and_ordering() {
        let mut book = ContactBook::new();
        let bob = Address::new("0xbob");
        let carol = Address::new("0xcarol");
        let dave = Address::new("0xdave");
        book.observe(&bob, &DialogId("b".into()), "old".into(), ts(1));
        book.observe(&carol, &DialogId("c".into()), "new".into(), ts(2));
        book.set_blocked(&dave, &DialogId("e".into()), true);

        assert!(book.is_blocked(&dave));
        assert!(!book.is_blocked(&bob));
        let order: Vec<_> = book.all().into_iter().map(|c| c.address).collect();
        assert_eq!(order, vec![carol, bob, dave]);
    }

    #[test]
    fn test_removed_contact_comes_back_fresh() {
        let mut book = ContactBook::new();
        let bob = Address::new("0xbob");
        let dialog = DialogId("d".into());
        book.observe(&bob, &dialog, "hi".into(), ts(1));
        book.increment_unread(&bob);

        assert_eq!(book.remove(&bob).map(|c| c.unread), Some(1));
        assert!(book.remove(&bob).is_none());
        assert!(book.all().is_empty());

        book.observe(&bob, &dialog, "again".into(), ts(2));
        assert_eq!(book.get(&bob).unwrap().unread, 0);
    }
}
