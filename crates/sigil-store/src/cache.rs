//! The storage contract the engine writes through.
//!
//! Every operation is idempotent: applying it again with the same arguments
//! leaves the store in the same state. The engine relies on this because
//! cache writes are fire-and-forget and may be replayed after a reconnect.

use sigil_shared::{Address, Contact, DialogId, DisappearingTimer, Message, MessageId};

use crate::error::Result;

pub trait CacheStore: Send {
    /// Insert or replace a message by id.
    fn put_message(&mut self, message: &Message) -> Result<()>;

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// A page of a dialog's history in ascending timestamp order. `offset`
    /// counts back from the newest message, so offset 0 is the latest page.
    fn get_dialog_messages(
        &self,
        dialog_id: &DialogId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    /// Returns whether a row was removed.
    fn delete_message(&mut self, id: &MessageId) -> Result<bool>;

    /// Returns the number of rows removed.
    fn delete_dialog_messages(&mut self, dialog_id: &DialogId) -> Result<usize>;

    /// Replace a temporary id by its durable id, including every `reply_to`
    /// that points at it.
    fn rename_message(&mut self, temp_id: &MessageId, durable_id: &MessageId) -> Result<()>;

    fn put_contact(&mut self, contact: &Contact) -> Result<()>;

    fn get_all_contacts(&self) -> Result<Vec<Contact>>;

    fn delete_contact(&mut self, address: &Address) -> Result<bool>;

    fn set_dialog_timer(&mut self, dialog_id: &DialogId, timer: DisappearingTimer) -> Result<()>;

    /// Every dialog whose timer is not `Off`.
    fn get_dialog_timers(&self) -> Result<Vec<(DialogId, DisappearingTimer)>>;
}

impl CacheStore for crate::Database {
    fn put_message(&mut self, message: &Message) -> Result<()> {
        self.upsert_message(message)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        self.find_message(id)
    }

    fn get_dialog_messages(
        &self,
        dialog_id: &DialogId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        self.get_messages_for_dialog(dialog_id, limit, offset)
    }

    fn delete_message(&mut self, id: &MessageId) -> Result<bool> {
        self.remove_message(id)
    }

    fn delete_dialog_messages(&mut self, dialog_id: &DialogId) -> Result<usize> {
        self.remove_dialog_messages(dialog_id)
    }

    fn rename_message(&mut self, temp_id: &MessageId, durable_id: &MessageId) -> Result<()> {
        self.rename_message_id(temp_id, durable_id)
    }

    fn put_contact(&mut self, contact: &Contact) -> Result<()> {
        self.upsert_contact(contact)
    }

    fn get_all_contacts(&self) -> Result<Vec<Contact>> {
        self.list_contacts()
    }

    fn delete_contact(&mut self, address: &Address) -> Result<bool> {
        self.remove_contact(address)
    }

    fn set_dialog_timer(&mut self, dialog_id: &DialogId, timer: DisappearingTimer) -> Result<()> {
        self.store_dialog_timer(dialog_id, timer)
    }

    fn get_dialog_timers(&self) -> Result<Vec<(DialogId, DisappearingTimer)>> {
        self.list_dialog_timers()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use sigil_shared::MessageStatus;

    use super::*;
    use crate::{Database, MemoryStore};

    fn message(id: &str, dialog: &str, ts: i64) -> Message {
        Message {
            id: MessageId::new(id),
            dialog_id: DialogId(dialog.into()),
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

    fn stores() -> Vec<(&'static str, Box<dyn CacheStore>)> {
        vec![
            ("sqlite", Box::new(Database::open_in_memory().unwrap())),
            ("memory", Box::new(MemoryStore::new())),
        ]
    }

    #[test]
    fn put_message_is_idempotent() {
        for (name, mut store) in stores() {
            let m = message("m1", "d", 1_000);
            store.put_message(&m).unwrap();
            store.put_message(&m).unwrap();

            let page = store.get_dialog_messages(&m.dialog_id, 10, 0).unwrap();
            assert_eq!(page, vec![m.clone()], "{name}");
            assert_eq!(store.get_message(&m.id).unwrap(), Some(m), "{name}");
        }
    }

    #[test]
    fn dialog_pages_are_ascending_and_offset_from_newest() {
        for (name, mut store) in stores() {
            for (i, ts) in [5_000, 1_000, 3_000, 4_000, 2_000].into_iter().enumerate() {
                store.put_message(&message(&format!("m{i}"), "d", ts)).unwrap();
            }
            store.put_message(&message("other", "e", 9_000)).unwrap();

            let dialog = DialogId("d".into());
            let latest: Vec<i64> = store
                .get_dialog_messages(&dialog, 2, 0)
                .unwrap()
                .iter()
                .map(|m| m.timestamp.timestamp_millis())
                .collect();
            assert_eq!(latest, vec![4_000, 5_000], "{name}");

            let older: Vec<i64> = store
                .get_dialog_messages(&dialog, 2, 2)
                .unwrap()
                .iter()
                .map(|m| m.timestamp.timestamp_millis())
                .collect();
            assert_eq!(older, vec![2_000, 3_000], "{name}");
        }
    }

    #[test]
    fn rename_rewrites_reply_references() {
        for (name, mut store) in stores() {
            let original = message("temp_1", "d", 1_000);
            let mut reply = message("m2", "d", 2_000);
            reply.reply_to = Some(MessageId::new("temp_1"));
            store.put_message(&original).unwrap();
            store.put_message(&reply).unwrap();

            let durable = MessageId::new("msg_42");
            store.rename_message(&original.id, &durable).unwrap();
            store.rename_message(&original.id, &durable).unwrap();

            assert!(store.get_message(&original.id).unwrap().is_none(), "{name}");
            assert!(store.get_message(&durable).unwrap().is_some(), "{name}");
            let reply = store.get_message(&MessageId::new("m2")).unwrap().unwrap();
            assert_eq!(reply.reply_to, Some(durable), "{name}");
        }
    }

    #[test]
    fn delete_operations() {
        for (name, mut store) in stores() {
            store.put_message(&message("a", "d", 1)).unwrap();
            store.put_message(&message("b", "d", 2)).unwrap();
            store.put_message(&message("c", "e", 3)).unwrap();

            assert!(store.delete_message(&MessageId::new("a")).unwrap(), "{name}");
            assert!(!store.delete_message(&MessageId::new("a")).unwrap(), "{name}");
            assert_eq!(store.delete_dialog_messages(&DialogId("d".into())).unwrap(), 1, "{name}");
            assert_eq!(store.delete_dialog_messages(&DialogId("d".into())).unwrap(), 0, "{name}");
            assert!(store.get_message(&MessageId::new("c")).unwrap().is_some(), "{name}");
        }
    }

    #[test]
    fn contacts_round_trip() {
        for (name, mut store) in stores() {
            let address = Address::new("0xbob");
            let mut contact = Contact::new(address.clone(), DialogId("d".into()));
            contact.unread = 3;
            contact.blocked = true;
            contact.last_timestamp = Some(Utc.timestamp_millis_opt(10).unwrap());
            store.put_contact(&contact).unwrap();
            store.put_contact(&contact).unwrap();

            assert_eq!(store.get_all_contacts().unwrap(), vec![contact], "{name}");
            assert!(store.delete_contact(&address).unwrap(), "{name}");
            assert!(store.get_all_contacts().unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn dialog_timers() {
        for (name, mut store) in stores() {
            let dialog = DialogId("d".into());
            let timer = DisappearingTimer::After(Duration::from_secs(60));
            store.set_dialog_timer(&dialog, timer).unwrap();
            assert_eq!(store.get_dialog_timers().unwrap(), vec![(dialog.clone(), timer)], "{name}");

            store.set_dialog_timer(&dialog, DisappearingTimer::Off).unwrap();
            assert!(store.get_dialog_timers().unwrap().is_empty(), "{name}");
        }
    }
}
