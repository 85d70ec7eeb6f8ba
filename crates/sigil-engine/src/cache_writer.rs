//! Single-writer actor in front of the durable cache.
//!
//! The store lives on one blocking task. Writes are fire-and-forget: a full
//! queue or a failed write is logged and dropped, never retried, so the live
//! message path cannot stall on disk. Reads carry a reply channel.

use sigil_shared::{Address, Contact, DialogId, DisappearingTimer, Message, MessageId};
use sigil_store::{CacheStore, StoreError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

type Reply<T> = oneshot::Sender<std::result::Result<T, StoreError>>;

enum CacheOp {
    PutMessage(Box<Message>),
    DeleteMessage(MessageId),
    DeleteDialog(DialogId),
    Rename { temp: MessageId, durable: MessageId },
    PutContact(Box<Contact>),
    DeleteContact(Address),
    SetTimer(DialogId, DisappearingTimer),
    LoadPage {
        dialog_id: DialogId,
        limit: usize,
        offset: usize,
        reply: Reply<Vec<Message>>,
    },
    LoadMessage(MessageId, Reply<Option<Message>>),
    LoadContacts(Reply<Vec<Contact>>),
    LoadTimers(Reply<Vec<(DialogId, DisappearingTimer)>>),
    Flush(oneshot::Sender<()>),
}

impl CacheOp {
    fn name(&self) -> &'static str {
        match self {
            Self::PutMessage(_) => "put_message",
            Self::DeleteMessage(_) => "delete_message",
            Self::DeleteDialog(_) => "delete_dialog_messages",
            Self::Rename { .. } => "rename_message",
            Self::PutContact(_) => "put_contact",
            Self::DeleteContact(_) => "delete_contact",
            Self::SetTimer(..) => "set_dialog_timer",
            Self::LoadPage { .. } => "get_dialog_messages",
            Self::LoadMessage(..) => "get_message",
            Self::LoadContacts(_) => "get_all_contacts",
            Self::LoadTimers(_) => "get_dialog_timers",
            Self::Flush(_) => "flush",
        }
    }
}

/// Cloneable handle to the cache actor.
#[derive(Clone)]
pub struct CacheWriter {
    tx: mpsc::Sender<CacheOp>,
}

impl CacheWriter {
    /// Move `store` onto a blocking task. Must be called from within a
    /// tokio runtime. The task ends once every handle is dropped.
    pub fn spawn<S>(store: S, capacity: usize) -> Self
    where
        S: CacheStore + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::task::spawn_blocking(move || run(store, rx));
        Self { tx }
    }

    fn submit(&self, op: CacheOp) {
        let name = op.name();
        if let Err(e) = self.tx.try_send(op) {
            warn!(op = name, error = %e, "cache write dropped");
        }
    }

    pub fn put_message(&self, message: &Message) {
        self.submit(CacheOp::PutMessage(Box::new(message.clone())));
    }

    pub fn delete_message(&self, id: &MessageId) {
        self.submit(CacheOp::DeleteMessage(id.clone()));
    }

    pub fn delete_dialog_messages(&self, dialog_id: &DialogId) {
        self.submit(CacheOp::DeleteDialog(dialog_id.clone()));
    }

    pub fn rename_message(&self, temp: &MessageId, durable: &MessageId) {
        self.submit(CacheOp::Rename {
            temp: temp.clone(),
            durable: durable.clone(),
        });
    }

    pub fn put_contact(&self, contact: &Contact) {
        self.submit(CacheOp::PutContact(Box::new(contact.clone())));
    }

    pub fn delete_contact(&self, address: &Address) {
        self.submit(CacheOp::DeleteContact(address.clone()));
    }

    pub fn set_dialog_timer(&self, dialog_id: &DialogId, timer: DisappearingTimer) {
        self.submit(CacheOp::SetTimer(dialog_id.clone(), timer));
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> CacheOp) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::CacheClosed)?;
        Ok(rx.await.map_err(|_| EngineError::CacheClosed)??)
    }

    pub async fn load_page(&self, dialog_id: &DialogId, limit: usize, offset: usize) -> Result<Vec<Message>> {
        let dialog_id = dialog_id.clone();
        self.request(|reply| CacheOp::LoadPage {
            dialog_id,
            limit,
            offset,
            reply,
        })
        .await
    }

    pub async fn load_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let id = id.clone();
        self.request(|reply| CacheOp::LoadMessage(id, reply)).await
    }

    pub async fn load_contacts(&self) -> Result<Vec<Contact>> {
        self.request(CacheOp::LoadContacts).await
    }

    pub async fn load_timers(&self) -> Result<Vec<(DialogId, DisappearingTimer)>> {
        self.request(CacheOp::LoadTimers).await
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(CacheOp::Flush(done))
            .await
            .map_err(|_| EngineError::CacheClosed)?;
        rx.await.map_err(|_| EngineError::CacheClosed)
    }
}

fn run<S: CacheStore>(mut store: S, mut rx: mpsc::Receiver<CacheOp>) {
    debug!("cache writer started");
    while let Some(op) = rx.blocking_recv() {
        let name = op.name();
        let outcome = match op {
            CacheOp::PutMessage(m) => store.put_message(&m),
            CacheOp::DeleteMessage(id) => store.delete_message(&id).map(drop),
            CacheOp::DeleteDialog(dialog_id) => store.delete_dialog_messages(&dialog_id).map(drop),
            CacheOp::Rename { temp, durable } => store.rename_message(&temp, &durable),
            CacheOp::PutContact(c) => store.put_contact(&c),
            CacheOp::DeleteContact(address) => store.delete_contact(&address).map(drop),
            CacheOp::SetTimer(dialog_id, timer) => store.set_dialog_timer(&dialog_id, timer),
            CacheOp::LoadPage {
                dialog_id,
                limit,
                offset,
                reply,
            } => {
                let _ = reply.send(store.get_dialog_messages(&dialog_id, limit, offset));
                Ok(())
            }
            CacheOp::LoadMessage(id, reply) => {
                let _ = reply.send(store.get_message(&id));
                Ok(())
            }
            CacheOp::LoadContacts(reply) => {
                let _ = reply.send(store.get_all_contacts());
                Ok(())
            }
            CacheOp::LoadTimers(reply) => {
                let _ = reply.send(store.get_dialog_timers());
                Ok(())
            }
            CacheOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(e) = outcome {
            warn!(op = name, error = %e, "cache write failed");
        }
    }
    info!("cache writer stopped");
}
