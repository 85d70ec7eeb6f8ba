//! Volatile [`CacheStore`] used by tests and by sessions that opt out of
//! persistence.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use sigil_shared::{Address, Contact, DialogId, DisappearingTimer, Message, MessageId};

use crate::cache::CacheStore;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: HashMap<MessageId, Message>,
    contacts: HashMap<Address, Contact>,
    timers: BTreeMap<DialogId, DisappearingTimer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl CacheStore for MemoryStore {
    fn put_message(&mut self, message: &Message) -> Result<()> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.messages.get(id).cloned())
    }

    fn get_dialog_messages(
        &self,
        dialog_id: &DialogId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let mut dialog: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| &m.dialog_id == dialog_id)
            .collect();
        dialog.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));

        let mut page: Vec<Message> = dialog.into_iter().skip(offset).take(limit).cloned().collect();
        page.reverse();
        Ok(page)
    }

    fn delete_message(&mut self, id: &MessageId) -> Result<bool> {
        Ok(self.messages.remove(id).is_some())
    }

    fn delete_dialog_messages(&mut self, dialog_id: &DialogId) -> Result<usize> {
        let before = self.messages.len();
        self.messages.retain(|_, m| &m.dialog_id != dialog_id);
        Ok(before - self.messages.len())
    }

    fn rename_message(&mut self, temp_id: &MessageId, durable_id: &MessageId) -> Result<()> {
        if let Some(mut message) = self.messages.remove(temp_id) {
            if !self.messages.contains_key(durable_id) {
                message.id = durable_id.clone();
                self.messages.insert(durable_id.clone(), message);
            }
        }
        for message in self.messages.values_mut() {
            if message.reply_to.as_ref() == Some(temp_id) {
                message.reply_to = Some(durable_id.clone());
            }
        }
        Ok(())
    }

    fn put_contact(&mut self, contact: &Contact) -> Result<()> {
        self.contacts.insert(contact.address.clone(), contact.clone());
        Ok(())
    }

    fn get_all_contacts(&self) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| {
            (a.last_timestamp.is_none(), Reverse(a.last_timestamp), &a.address).cmp(&(
                b.last_timestamp.is_none(),
                Reverse(b.last_timestamp),
                &b.address,
            ))
        });
        Ok(contacts)
    }

    fn delete_contact(&mut self, address: &Address) -> Result<bool> {
        Ok(self.contacts.remove(address).is_some())
    }

    fn set_dialog_timer(&mut self, dialog_id: &DialogId, timer: DisappearingTimer) -> Result<()> {
        match timer {
            DisappearingTimer::Off => {
                self.timers.remove(dialog_id);
            }
            DisappearingTimer::After(_) => {
                self.timers.insert(dialog_id.clone(), timer);
            }
        }
        Ok(())
    }

    fn get_dialog_timers(&self) -> Result<Vec<(DialogId, DisappearingTimer)>> {
        Ok(self.timers.iter().map(|(d, t)| (d.clone(), *t)).collect())
    }
}
