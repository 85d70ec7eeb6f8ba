//! The session actor.
//!
//! One task owns the inbox, the reconciler, the contact book and the typing
//! tracker. Relay events are decrypted concurrently but applied strictly in
//! arrival order through a `FuturesOrdered` queue. Callers talk to the actor
//! through a cloneable [`SessionHandle`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use sigil_net::{spawn_transport, TransportEvent, TransportHandle};
use sigil_shared::constants::TEMP_ID_PREFIX;
use sigil_shared::protocol::{ClientFrame, RoomWireMessage, ServerEvent, WireMessage};
use sigil_shared::{
    Address, ConnectionState, Contact, DialogId, DisappearingTimer, Identity, Message, MessageId,
    MessageStatus,
};
use sigil_store::{CacheStore, Database};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::cache_writer::CacheWriter;
use crate::config::EngineConfig;
use crate::contacts::ContactBook;
use crate::decrypt::{DecryptRequest, DecryptionPipeline};
use crate::error::{EngineError, Result};
use crate::inbox::{Inbox, LoadState};
use crate::keys::{Directory, HttpDirectory, KeyResolver};
use crate::ledger::Ledger;
use crate::observer::{ObserverSlot, SessionObserver};
use crate::outbound::{self, Draft};
use crate::presence::TypingTracker;
use crate::reconcile::{AdmitOptions, Admission, Reconciler};

const COMMAND_CAPACITY: usize = 256;
const CACHE_CAPACITY: usize = 1024;

/// Snapshot of one timeline for rendering.
#[derive(Debug, Clone)]
pub struct TimelineView {
    pub dialog_id: DialogId,
    pub state: LoadState,
    pub loading_older: bool,
    pub exhausted: bool,
    pub messages: Vec<Message>,
    pub pinned: Option<MessageId>,
    pub timer: DisappearingTimer,
    pub typing: Vec<Address>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Send {
        draft: Draft,
        key: PublicKey,
        reply: Reply<Result<MessageId>>,
    },
    SendRoom {
        room_id: String,
        text: String,
        reply_to: Option<MessageId>,
        reply: Reply<Result<MessageId>>,
    },
    Open {
        dialog_id: DialogId,
        reply: Reply<Result<usize>>,
    },
    LoadMore {
        dialog_id: DialogId,
        count: usize,
        reply: Reply<Result<usize>>,
    },
    SetActive(Option<DialogId>),
    Typing(DialogId),
    JoinRoom(String),
    SetDisappearing(DialogId, DisappearingTimer),
    SetBlocked(Address, bool),
    DeleteContact(Address, Reply<bool>),
    PendingTx(Reply<Vec<(DialogId, MessageId, String)>>),
    ApplyLedger {
        updates: Vec<(DialogId, MessageId, MessageStatus)>,
        reply: Reply<usize>,
    },
    Timeline(DialogId, Reply<Option<TimelineView>>),
    Contacts(Reply<Vec<Contact>>),
    Shutdown(Reply<()>),
}

/// Relay work whose decryption has finished, in arrival order.
enum Ready {
    Skip,
    Message {
        candidate: Box<Message>,
        opts: AdmitOptions,
    },
    Edit {
        dialog_id: DialogId,
        id: MessageId,
        ciphertext: String,
        ciphertext_self: Option<String>,
        edit_count: u32,
        text: String,
    },
    Event(ServerEvent),
}

/// Completions from tasks the actor spawned.
enum Internal {
    PageLoaded {
        dialog_id: DialogId,
        older: bool,
        requested: usize,
        page: Result<Vec<Message>>,
        reply: Reply<Result<usize>>,
    },
    TypingCheck(DialogId, Address),
    Ready(Ready),
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    me: Address,
    cmd_tx: mpsc::Sender<Command>,
    observer: Arc<ObserverSlot>,
    keys: Arc<KeyResolver>,
    transport: TransportHandle,
}

/// Open the SQLite cache named by `config` and connect to the relay.
pub async fn open_session(identity: Identity, config: EngineConfig) -> Result<SessionHandle> {
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let directory = Arc::new(HttpDirectory::new(
        config.directory_url.clone(),
        config.directory_timeout,
    )?);
    Ok(spawn_session(identity, config, directory, db).await)
}

/// Start a session on top of a live relay connection.
pub async fn spawn_session<S>(
    identity: Identity,
    config: EngineConfig,
    directory: Arc<dyn Directory>,
    store: S,
) -> SessionHandle
where
    S: CacheStore + 'static,
{
    let subscribe = ClientFrame::Subscribe {
        identity: identity.address().clone(),
        identity_hash: identity.address_hash(),
    };
    let (transport, events) = spawn_transport(config.transport.clone(), subscribe);
    spawn_session_with_transport(identity, config, directory, store, transport, events).await
}

/// Start a session on an existing transport. The event receiver must belong
/// to the same transport as `transport`.
pub async fn spawn_session_with_transport<S>(
    identity: Identity,
    config: EngineConfig,
    directory: Arc<dyn Directory>,
    store: S,
    transport: TransportHandle,
    events: mpsc::Receiver<TransportEvent>,
) -> SessionHandle
where
    S: CacheStore + 'static,
{
    let identity = Arc::new(identity);
    let me = identity.address().clone();
    let keys = Arc::new(
        KeyResolver::new(directory, config.key_cache_capacity)
            .with_lookup_timeout(config.directory_timeout),
    );
    keys.insert_known(me.clone(), identity.public_key());

    let cache = CacheWriter::spawn(store, CACHE_CAPACITY);

    let mut contacts = ContactBook::new();
    match cache.load_contacts().await {
        Ok(loaded) => {
            debug!(count = loaded.len(), "contacts loaded");
            contacts.load(loaded);
        }
        Err(e) => warn!(error = %e, "failed to load contacts, starting empty"),
    }

    let mut inbox = Inbox::new();
    match cache.load_timers().await {
        Ok(timers) => {
            for (dialog_id, timer) in timers {
                inbox.timeline_mut(&dialog_id).set_timer(timer);
            }
        }
        Err(e) => warn!(error = %e, "failed to load disappearing timers"),
    }

    let observer = Arc::new(ObserverSlot::default());
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        me: me.clone(),
        pipeline: DecryptionPipeline::new(identity.clone(), keys.clone(), config.decrypt_timeout),
        identity,
        keys: keys.clone(),
        cache,
        transport: transport.clone(),
        observer: observer.clone(),
        reconciler: Reconciler::new(config.admitted_capacity),
        typing: TypingTracker::new(config.typing_window),
        inbox,
        contacts,
        next_temp: 1,
        internal_tx,
        config,
    };
    info!(address = %me, "session started");
    tokio::spawn(actor.run(cmd_rx, internal_rx, events));

    SessionHandle {
        me,
        cmd_tx,
        observer,
        keys,
        transport,
    }
}

impl SessionHandle {
    pub fn address(&self) -> &Address {
        &self.me
    }

    pub fn dialog_with(&self, other: &Address) -> DialogId {
        DialogId::between(&self.me, other)
    }

    pub fn connection(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Swap the observer; the next callback goes to the new one.
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observer.set(observer);
    }

    async fn submit(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::SessionClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(make(reply)).await?;
        rx.await.map_err(|_| EngineError::SessionClosed)
    }

    /// Seal and send a direct message. Returns the temporary id the message
    /// is shown under until the relay confirms it.
    pub async fn send_message(
        &self,
        recipient: Address,
        text: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        if recipient.is_unknown() {
            warn!(recipient = %recipient, "refusing to send to a placeholder address");
            return Err(EngineError::UnknownRecipient);
        }
        let key = self
            .keys
            .resolve(&recipient)
            .await
            .ok_or_else(|| EngineError::RecipientKeyUnavailable(recipient.clone()))?;
        let draft = Draft {
            recipient,
            text: text.into(),
            reply_to,
            attachment_ref: None,
        };
        self.request(|reply| Command::Send {
            draft,
            key: key.public_key,
            reply,
        })
        .await?
    }

    pub async fn send_room_message(
        &self,
        room_id: impl Into<String>,
        text: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let room_id = room_id.into();
        let text = text.into();
        self.request(|reply| Command::SendRoom {
            room_id,
            text,
            reply_to,
            reply,
        })
        .await?
    }

    /// Load the newest page of `dialog_id` from the cache. A timeline that is
    /// already loaded or loading is left alone and reports zero.
    pub async fn open_dialog(&self, dialog_id: DialogId) -> Result<usize> {
        self.request(|reply| Command::Open { dialog_id, reply }).await?
    }

    /// Fetch up to `before_count` messages older than the oldest shown.
    pub async fn load_more(&self, dialog_id: DialogId, before_count: usize) -> Result<usize> {
        self.request(|reply| Command::LoadMore {
            dialog_id,
            count: before_count,
            reply,
        })
        .await?
    }

    pub async fn set_active_dialog(&self, dialog_id: Option<DialogId>) -> Result<()> {
        self.submit(Command::SetActive(dialog_id)).await
    }

    pub async fn send_typing(&self, dialog_id: DialogId) -> Result<()> {
        self.submit(Command::Typing(dialog_id)).await
    }

    pub async fn join_room(&self, room_id: impl Into<String>) -> Result<()> {
        self.submit(Command::JoinRoom(room_id.into())).await
    }

    pub async fn set_disappearing(&self, dialog_id: DialogId, timer: DisappearingTimer) -> Result<()> {
        self.submit(Command::SetDisappearing(dialog_id, timer)).await
    }

    pub async fn block(&self, address: Address) -> Result<()> {
        self.submit(Command::SetBlocked(address, true)).await
    }

    pub async fn unblock(&self, address: Address) -> Result<()> {
        self.submit(Command::SetBlocked(address, false)).await
    }

    /// Remove `address` from the contact list. Its messages stay cached.
    /// Returns `false` when there was no such contact.
    pub async fn delete_contact(&self, address: Address) -> Result<bool> {
        self.request(|reply| Command::DeleteContact(address, reply)).await
    }

    /// Ask the ledger about every transaction-backed message that is not
    /// final yet. Returns how many messages changed status.
    pub async fn verify_pending(&self, ledger: &dyn Ledger) -> Result<usize> {
        let pending = self.request(Command::PendingTx).await?;
        let mut updates = Vec::new();
        for (dialog_id, id, tx_id) in pending {
            match ledger.tx_outcome(&tx_id).await {
                Ok(outcome) => {
                    if let Some(status) = outcome.status() {
                        updates.push((dialog_id, id, status));
                    }
                }
                Err(e) => warn!(tx = %tx_id, error = %e, "ledger query failed"),
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }
        self.request(|reply| Command::ApplyLedger { updates, reply })
            .await
    }

    pub async fn timeline(&self, dialog_id: DialogId) -> Result<Option<TimelineView>> {
        self.request(|reply| Command::Timeline(dialog_id, reply))
            .await
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        self.request(Command::Contacts).await
    }

    /// Stop reconnecting, apply whatever was already received and flush the
    /// cache. Later calls on any clone fail with `SessionClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct SessionActor {
    me: Address,
    identity: Arc<Identity>,
    config: EngineConfig,
    pipeline: DecryptionPipeline,
    keys: Arc<KeyResolver>,
    cache: CacheWriter,
    transport: TransportHandle,
    observer: Arc<ObserverSlot>,
    inbox: Inbox,
    reconciler: Reconciler,
    contacts: ContactBook,
    typing: TypingTracker,
    next_temp: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut queue: FuturesOrdered<BoxFuture<'static, Ready>> = FuturesOrdered::new();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown(done)) => {
                        self.stop(&mut queue).await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.stop(&mut queue).await;
                        break;
                    }
                },
                Some(internal) = internal_rx.recv() => self.on_internal(internal),
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_transport(event, &mut queue),
                    None => {
                        debug!("transport event stream ended");
                        events_open = false;
                    }
                },
                Some(ready) = queue.next(), if !queue.is_empty() => self.apply(ready),
                _ = sweep.tick() => self.sweep(),
            }
        }
        info!("session stopped");
    }

    async fn stop(&mut self, queue: &mut FuturesOrdered<BoxFuture<'static, Ready>>) {
        self.transport.shutdown();
        while let Some(ready) = queue.next().await {
            self.apply(ready);
        }
        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "cache flush on shutdown failed");
        }
    }

    // ---- commands ----

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { draft, key, reply } => {
                let _ = reply.send(self.send_direct(draft, &key));
            }
            Command::SendRoom {
                room_id,
                text,
                reply_to,
                reply,
            } => {
                let _ = reply.send(Ok(self.send_room(room_id, text, reply_to)));
            }
            Command::Open { dialog_id, reply } => self.open(dialog_id, reply),
            Command::LoadMore {
                dialog_id,
                count,
                reply,
            } => self.load_more(dialog_id, count, reply),
            Command::SetActive(dialog_id) => self.set_active(dialog_id),
            Command::Typing(dialog_id) => {
                let frame = match dialog_id.room_id() {
                    Some(room_id) => ClientFrame::RoomTyping {
                        room_id: room_id.to_string(),
                    },
                    None => ClientFrame::Typing {
                        dialog_hash: dialog_id,
                    },
                };
                self.transport.send(frame);
            }
            Command::JoinRoom(room_id) => self.join_room(room_id),
            Command::SetDisappearing(dialog_id, timer) => {
                self.inbox.timeline_mut(&dialog_id).set_timer(timer);
                self.cache.set_dialog_timer(&dialog_id, timer);
                info!(dialog = %dialog_id, ttl = ?timer.ttl(), "disappearing timer set");
            }
            Command::SetBlocked(address, blocked) => {
                let dialog_id = DialogId::between(&self.me, &address);
                let contact = self.contacts.set_blocked(&address, &dialog_id, blocked);
                self.cache.put_contact(contact);
                info!(address = %address, blocked, "contact block state changed");
            }
            Command::DeleteContact(address, reply) => {
                let removed = self.contacts.remove(&address).is_some();
                if removed {
                    self.cache.delete_contact(&address);
                    info!(address = %address, "contact deleted");
                }
                let _ = reply.send(removed);
            }
            Command::PendingTx(reply) => {
                let _ = reply.send(self.inbox.pending_transactions());
            }
            Command::ApplyLedger { updates, reply } => {
                let _ = reply.send(self.apply_ledger(updates));
            }
            Command::Timeline(dialog_id, reply) => {
                let _ = reply.send(self.view(&dialog_id));
            }
            Command::Contacts(reply) => {
                let _ = reply.send(self.contacts.all());
            }
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_temp;
        self.next_temp += 1;
        seq
    }

    fn send_direct(&mut self, draft: Draft, key: &PublicKey) -> Result<MessageId> {
        if draft.recipient.is_unknown() {
            return Err(EngineError::UnknownRecipient);
        }
        let seq = self.next_seq();
        let prepared = outbound::prepare(&self.identity, key, draft, seq, Utc::now())?;
        let mut message = prepared.message;
        if !self.transport.send(prepared.frame) {
            warn!(id = %message.id, "relay not connected, message marked failed");
            message.status = MessageStatus::Failed;
        }
        let id = message.id.clone();
        self.admit(message, AdmitOptions::silent());
        Ok(id)
    }

    fn send_room(&mut self, room_id: String, text: String, reply_to: Option<MessageId>) -> MessageId {
        let now = Utc::now();
        let temp_id = MessageId::temporary(self.next_seq());
        let frame = ClientFrame::RoomMessage {
            room_id: room_id.clone(),
            sender: self.me.clone(),
            content: text.clone(),
            timestamp: now.timestamp_millis(),
            temp_id: temp_id.clone(),
            reply_to: reply_to.clone(),
        };
        let status = if self.transport.send(frame) {
            MessageStatus::Pending
        } else {
            warn!(room = %room_id, "relay not connected, room message marked failed");
            MessageStatus::Failed
        };
        let message = Message {
            id: temp_id.clone(),
            dialog_id: DialogId::room(&room_id),
            sender: self.me.clone(),
            recipient: None,
            ciphertext: text.clone(),
            ciphertext_self: None,
            timestamp: now,
            status,
            plaintext: Some(text),
            reply_to,
            reply_preview: None,
            edited: false,
            edit_count: 0,
            reactions: Default::default(),
            attachment_ref: None,
            tx_id: None,
        };
        self.admit(message, AdmitOptions::silent());
        temp_id
    }

    fn open(&mut self, dialog_id: DialogId, reply: Reply<Result<usize>>) {
        if !self.inbox.timeline_mut(&dialog_id).begin_load() {
            let _ = reply.send(Ok(0));
            return;
        }
        let limit = self.config.page_size;
        self.spawn_page_load(dialog_id, false, limit, 0, reply);
    }

    fn load_more(&mut self, dialog_id: DialogId, count: usize, reply: Reply<Result<usize>>) {
        let timeline = self.inbox.timeline_mut(&dialog_id);
        if count == 0 || !timeline.begin_older() {
            let _ = reply.send(Ok(0));
            return;
        }
        let offset = timeline.len();
        self.spawn_page_load(dialog_id, true, count, offset, reply);
    }

    fn spawn_page_load(
        &self,
        dialog_id: DialogId,
        older: bool,
        limit: usize,
        offset: usize,
        reply: Reply<Result<usize>>,
    ) {
        let cache = self.cache.clone();
        let pipeline = self.pipeline.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let page = match cache.load_page(&dialog_id, limit, offset).await {
                Ok(mut page) => {
                    for m in page.iter_mut().filter(|m| m.plaintext.is_none()) {
                        let decrypted = pipeline.decrypt(DecryptRequest::from(&*m)).await;
                        m.plaintext = Some(decrypted.text);
                    }
                    Ok(page)
                }
                Err(e) => Err(e),
            };
            let _ = tx.send(Internal::PageLoaded {
                dialog_id,
                older,
                requested: limit,
                page,
                reply,
            });
        });
    }

    fn set_active(&mut self, dialog_id: Option<DialogId>) {
        if let Some(dialog_id) = dialog_id.as_ref() {
            if let Some(contact) = self.contacts.clear_unread(dialog_id) {
                self.cache.put_contact(contact);
            }
        }
        debug!(dialog = ?dialog_id.as_ref().map(|d| d.as_str()), "active dialog changed");
        self.inbox.set_active(dialog_id);
    }

    fn join_room(&mut self, room_id: String) {
        self.inbox.timeline_mut(&DialogId::room(&room_id));
        if !self.transport.subscribe_room(room_id.clone()) {
            warn!(room = %room_id, "room subscription dropped, transport queue full");
        }
    }

    fn apply_ledger(&mut self, updates: Vec<(DialogId, MessageId, MessageStatus)>) -> usize {
        let mut changed = 0;
        for (dialog_id, id, status) in updates {
            let Some(timeline) = self.inbox.existing_mut(&dialog_id) else {
                continue;
            };
            if timeline.set_status(&id, status) {
                changed += 1;
                self.persist_and_report(&dialog_id, &id, Admission::Updated);
            }
        }
        changed
    }

    fn view(&self, dialog_id: &DialogId) -> Option<TimelineView> {
        let timeline = self.inbox.timeline(dialog_id)?;
        Some(TimelineView {
            dialog_id: dialog_id.clone(),
            state: timeline.state(),
            loading_older: timeline.is_loading_older(),
            exhausted: timeline.is_exhausted(),
            messages: timeline.messages().to_vec(),
            pinned: timeline.pinned().cloned(),
            timer: timeline.timer(),
            typing: self.typing.typing(dialog_id),
        })
    }

    // ---- spawned-task completions ----

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::PageLoaded {
                dialog_id,
                older,
                requested,
                page,
                reply,
            } => {
                let result = self.page_loaded(&dialog_id, older, requested, page);
                let _ = reply.send(result);
            }
            Internal::TypingCheck(key, who) => {
                if self.typing.clear_if_stale(&key, &who, Instant::now()) {
                    self.observer.get().on_typing(&key, &who, false);
                }
            }
            Internal::Ready(ready) => self.apply(ready),
        }
    }

    fn page_loaded(
        &mut self,
        dialog_id: &DialogId,
        older: bool,
        requested: usize,
        page: Result<Vec<Message>>,
    ) -> Result<usize> {
        let timeline = self.inbox.timeline_mut(dialog_id);
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!(dialog = %dialog_id, error = %e, "history page failed to load");
                if older {
                    timeline.abort_older();
                } else {
                    timeline.abort_load();
                }
                return Err(e);
            }
        };

        // Keep fresh temp ids clear of unconfirmed sends from earlier runs.
        for m in &page {
            if let Some(seq) = m
                .id
                .as_str()
                .strip_prefix(TEMP_ID_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            {
                self.next_temp = self.next_temp.max(seq.saturating_add(1));
            }
        }
        self.reconciler.note_loaded(dialog_id, &page);

        let timeline = self.inbox.timeline_mut(dialog_id);
        let added = if older {
            timeline.finish_older(page, requested)
        } else {
            timeline.finish_load(page, requested)
        };
        debug!(dialog = %dialog_id, older, added, "history page merged");
        Ok(added)
    }

    // ---- relay events ----

    fn on_transport(&mut self, event: TransportEvent, queue: &mut FuturesOrdered<BoxFuture<'static, Ready>>) {
        let observer = self.observer.get();
        match event {
            TransportEvent::Opened => observer.on_connection(ConnectionState::Open),
            TransportEvent::Closed { reason } => {
                debug!(reason = %reason, "relay connection closed");
                observer.on_connection(ConnectionState::Closed);
            }
            TransportEvent::ReconnectScheduled { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");
                observer.on_connection(ConnectionState::Connecting);
            }
            TransportEvent::Event(event) => queue.push_back(self.prepare(event)),
        }
    }

    /// Start whatever decryption `event` needs. Everything else about the
    /// event is decided when it reaches the front of the queue.
    fn prepare(&self, event: ServerEvent) -> BoxFuture<'static, Ready> {
        match event {
            ServerEvent::MessageDetected(wire) => self.prepare_wire(wire, None),
            ServerEvent::TxConfirmed(wire) => self.prepare_wire(wire, Some(MessageStatus::Confirmed)),
            ServerEvent::RoomMessage(wire) => {
                let (candidate, opts) = room_candidate(wire);
                future::ready(Ready::Message {
                    candidate: Box::new(candidate),
                    opts,
                })
                .boxed()
            }
            ServerEvent::MessageUpdated {
                id,
                dialog_hash,
                ciphertext,
                ciphertext_self,
                edit_count,
            } => match self.inbox.find(&dialog_hash, &id) {
                Some(existing) => {
                    let request = DecryptRequest {
                        ciphertext: ciphertext.clone(),
                        ciphertext_self: ciphertext_self.clone(),
                        sender: existing.sender.clone(),
                        recipient: existing.recipient.clone(),
                    };
                    edit_future(
                        self.pipeline.clone(),
                        request,
                        dialog_hash,
                        id,
                        ciphertext,
                        ciphertext_self,
                        edit_count,
                    )
                }
                // The original may still be queued; look again when applied.
                None => future::ready(Ready::Event(ServerEvent::MessageUpdated {
                    id,
                    dialog_hash,
                    ciphertext,
                    ciphertext_self,
                    edit_count,
                }))
                .boxed(),
            },
            other => future::ready(Ready::Event(other)).boxed(),
        }
    }

    fn prepare_wire(&self, wire: WireMessage, status: Option<MessageStatus>) -> BoxFuture<'static, Ready> {
        let opts = AdmitOptions {
            silent: wire.catch_up,
            echo_of: wire.temp_id.clone(),
        };
        let mut candidate = message_from_wire(wire, status);
        if candidate.sender.is_unknown() {
            warn!(id = %candidate.id, "message from a placeholder sender dropped");
            return future::ready(Ready::Skip).boxed();
        }
        if candidate.recipient.is_none() && candidate.sender == self.me {
            candidate.recipient = self.infer_recipient(&candidate.dialog_id, opts.echo_of.as_ref());
        }

        // Already shown with the same ciphertext: reuse the plaintext.
        if let Some(existing) = self.inbox.find(&candidate.dialog_id, &candidate.id) {
            if existing.ciphertext == candidate.ciphertext && existing.plaintext.is_some() {
                candidate.plaintext = existing.plaintext.clone();
                return future::ready(Ready::Message {
                    candidate: Box::new(candidate),
                    opts,
                })
                .boxed();
            }
        }

        let pipeline = self.pipeline.clone();
        async move {
            let decrypted = pipeline.decrypt(DecryptRequest::from(&candidate)).await;
            candidate.plaintext = Some(decrypted.text);
            Ready::Message {
                candidate: Box::new(candidate),
                opts,
            }
        }
        .boxed()
    }

    fn infer_recipient(&self, dialog_id: &DialogId, echo_of: Option<&MessageId>) -> Option<Address> {
        if let Some(temp) = echo_of {
            if let Some(sent) = self.inbox.find(dialog_id, temp) {
                return sent.recipient.clone();
            }
        }
        self.contacts.by_dialog(dialog_id).map(|c| c.address.clone())
    }

    fn apply(&mut self, ready: Ready) {
        match ready {
            Ready::Skip => {}
            Ready::Message { candidate, opts } => self.admit(*candidate, opts),
            Ready::Edit {
                dialog_id,
                id,
                ciphertext,
                ciphertext_self,
                edit_count,
                text,
            } => {
                let Some(timeline) = self.inbox.existing_mut(&dialog_id) else {
                    return;
                };
                if !timeline.contains(&id) {
                    debug!(id = %id, "edit for a message no longer shown");
                    return;
                }
                let touched = timeline.apply_edit(&id, ciphertext, ciphertext_self, text, edit_count);
                self.persist(&dialog_id, &touched);
                self.report(&dialog_id, &id, Admission::Updated);
            }
            Ready::Event(event) => self.apply_event(event),
        }
    }

    fn admit(&mut self, candidate: Message, opts: AdmitOptions) {
        let outbound = candidate.is_outbound(&self.me);
        let counterparty = if candidate.dialog_id.is_room() {
            None
        } else {
            match candidate.counterparty(&self.me) {
                Some(address) if !address.is_unknown() => Some(address.clone()),
                _ => {
                    warn!(id = %candidate.id, "message with no usable counterparty dropped");
                    return;
                }
            }
        };
        let id = candidate.id.clone();
        let dialog_id = candidate.dialog_id.clone();
        let renaming = opts
            .echo_of
            .as_ref()
            .filter(|temp| self.reconciler.is_echo_of(temp, &candidate))
            .cloned();

        let admission = self.reconciler.admit(&mut self.inbox, candidate, &opts);
        let Some(stored) = self.inbox.find(&dialog_id, &id).cloned() else {
            return;
        };

        if let Some(temp) = renaming.filter(|temp| !self.reconciler.is_pending(temp)) {
            self.cache.rename_message(&temp, &id);
            debug!(temp = %temp, durable = %id, "send confirmed by echo");
        }
        self.cache.put_message(&stored);

        if admission != Admission::New {
            self.observer.get().on_message(&stored, admission);
            return;
        }

        let blocked = self.contacts.is_blocked(&stored.sender);
        if !outbound && self.typing.clear(&dialog_id, &stored.sender) {
            self.observer.get().on_typing(&dialog_id, &stored.sender, false);
        }

        if let Some(address) = counterparty {
            self.contacts
                .observe(&address, &dialog_id, stored.preview(), stored.timestamp);
            if let Some(name) = self.keys.cached_username(&address) {
                self.contacts.set_display_name(&address, name);
            }
            if !outbound && !blocked {
                if self.inbox.is_active(&dialog_id) {
                    self.send_read_receipt(&dialog_id, vec![id.clone()]);
                } else {
                    self.contacts.increment_unread(&address);
                }
            }
            if let Some(contact) = self.contacts.get(&address) {
                self.cache.put_contact(contact);
            }
        }

        let observer = self.observer.get();
        observer.on_message(&stored, Admission::New);
        if blocked {
            debug!(id = %id, sender = %stored.sender, "message from blocked sender stored silently");
        } else if !outbound && !opts.silent {
            observer.on_notify(&stored);
        }
    }

    fn send_read_receipt(&self, dialog_id: &DialogId, message_ids: Vec<MessageId>) {
        if !self.config.read_receipts || dialog_id.is_room() {
            return;
        }
        self.transport.send(ClientFrame::ReadReceipt {
            dialog_hash: dialog_id.clone(),
            message_ids,
            reader: self.me.clone(),
        });
    }

    fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageDetected(_) | ServerEvent::TxConfirmed(_) | ServerEvent::RoomMessage(_) => {
                debug!("message event reached apply without preparation");
            }
            ServerEvent::MessageUpdated {
                id,
                dialog_hash,
                ciphertext,
                ciphertext_self,
                edit_count,
            } => {
                let Some(existing) = self.inbox.find(&dialog_hash, &id) else {
                    debug!(id = %id, "edit for unknown message ignored");
                    return;
                };
                let request = DecryptRequest {
                    ciphertext: ciphertext.clone(),
                    ciphertext_self: ciphertext_self.clone(),
                    sender: existing.sender.clone(),
                    recipient: existing.recipient.clone(),
                };
                let work = edit_future(
                    self.pipeline.clone(),
                    request,
                    dialog_hash,
                    id,
                    ciphertext,
                    ciphertext_self,
                    edit_count,
                );
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Internal::Ready(work.await));
                });
            }
            ServerEvent::MessageDeleted { id, dialog_hash } => self.remove(&dialog_hash, &id),
            ServerEvent::ReactionUpdate {
                message_id,
                dialog_hash,
                reactions,
            } => {
                let changed = self
                    .inbox
                    .existing_mut(&dialog_hash)
                    .is_some_and(|t| t.set_reactions(&message_id, reactions));
                if changed {
                    self.persist_and_report(&dialog_hash, &message_id, Admission::Updated);
                }
            }
            ServerEvent::DmSent {
                temp_id,
                durable_id,
                dialog_hash,
            } => self.confirm_sent(&dialog_hash, &temp_id, &durable_id),
            ServerEvent::DmCleared { dialog_hash } => {
                let removed = self
                    .inbox
                    .existing_mut(&dialog_hash)
                    .map(|t| t.clear())
                    .unwrap_or_default();
                self.cache.delete_dialog_messages(&dialog_hash);
                info!(dialog = %dialog_hash, count = removed.len(), "dialog cleared");
                let observer = self.observer.get();
                for id in &removed {
                    observer.on_removed(&dialog_hash, id);
                }
            }
            ServerEvent::RoomCreated { room_id, name } => {
                info!(room = %room_id, name = name.as_deref().unwrap_or_default(), "room created");
                self.join_room(room_id);
            }
            ServerEvent::RoomDeleted { room_id } => {
                self.transport.unsubscribe_room(room_id.clone());
                let dialog_id = DialogId::room(&room_id);
                let removed = self
                    .inbox
                    .remove_timeline(&dialog_id)
                    .map(|mut t| t.clear())
                    .unwrap_or_default();
                self.cache.delete_dialog_messages(&dialog_id);
                info!(room = %room_id, "room deleted");
                let observer = self.observer.get();
                for id in &removed {
                    observer.on_removed(&dialog_id, id);
                }
            }
            ServerEvent::PinUpdate {
                dialog_hash,
                message_id,
            } => {
                self.inbox.timeline_mut(&dialog_hash).set_pinned(message_id);
            }
            ServerEvent::ProfileDetected { address } => self.keys.invalidate(&address),
            ServerEvent::ReadReceipt {
                dialog_hash,
                message_ids,
                reader,
            } => {
                if reader == self.me {
                    return;
                }
                let changed = self
                    .inbox
                    .existing_mut(&dialog_hash)
                    .map(|t| t.mark_read(&message_ids, &self.me))
                    .unwrap_or_default();
                for id in &changed {
                    self.persist_and_report(&dialog_hash, id, Admission::Updated);
                }
            }
            ServerEvent::Typing {
                dialog_hash,
                sender,
            } => self.on_typing(dialog_hash, sender),
            ServerEvent::RoomTyping { room_id, sender } => {
                self.on_typing(DialogId::room(&room_id), sender)
            }
        }
    }

    fn confirm_sent(&mut self, dialog_id: &DialogId, temp: &MessageId, durable: &MessageId) {
        match self.reconciler.pending_dialog(temp) {
            None => {
                debug!(temp = %temp, "confirmation for unknown temp id");
                return;
            }
            Some(sent_to) if sent_to != dialog_id => {
                warn!(temp = %temp, dialog = %dialog_id, "confirmation for another dialog ignored");
                return;
            }
            Some(_) => {}
        }
        let Some(renamed) = self.reconciler.rename(&mut self.inbox, temp, durable) else {
            return;
        };
        if let Some(timeline) = self.inbox.existing_mut(&renamed.dialog_id) {
            timeline.merge_status(durable, MessageStatus::Sent);
        }
        self.cache.rename_message(temp, durable);
        self.persist(&renamed.dialog_id, &renamed.touched);
        self.report(&renamed.dialog_id, durable, Admission::Updated);
        debug!(temp = %temp, durable = %durable, "send confirmed");
    }

    fn remove(&mut self, dialog_id: &DialogId, id: &MessageId) {
        let removed = self.inbox.existing_mut(dialog_id).and_then(|t| t.remove(id));
        self.cache.delete_message(id);
        let Some((_, touched)) = removed else {
            return;
        };
        self.persist(dialog_id, &touched);
        self.observer.get().on_removed(dialog_id, id);
    }

    fn on_typing(&mut self, key: DialogId, who: Address) {
        if who == self.me {
            return;
        }
        if self.typing.touch(&key, &who, Instant::now()) {
            self.observer.get().on_typing(&key, &who, true);
        }
        let window = self.typing.window();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(Internal::TypingCheck(key, who));
        });
    }

    fn sweep(&mut self) {
        let expired = self.inbox.sweep(Utc::now());
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "disappearing messages expired");
        let observer = self.observer.get();
        for (dialog_id, id) in &expired {
            self.cache.delete_message(id);
            observer.on_removed(dialog_id, id);
        }
    }

    // ---- helpers ----

    fn persist(&self, dialog_id: &DialogId, ids: &[MessageId]) {
        for id in ids {
            if let Some(m) = self.inbox.find(dialog_id, id) {
                self.cache.put_message(m);
            }
        }
    }

    fn report(&self, dialog_id: &DialogId, id: &MessageId, admission: Admission) {
        if let Some(m) = self.inbox.find(dialog_id, id) {
            self.observer.get().on_message(m, admission);
        }
    }

    fn persist_and_report(&self, dialog_id: &DialogId, id: &MessageId, admission: Admission) {
        self.persist(dialog_id, std::slice::from_ref(id));
        self.report(dialog_id, id, admission);
    }
}

fn edit_future(
    pipeline: DecryptionPipeline,
    request: DecryptRequest,
    dialog_id: DialogId,
    id: MessageId,
    ciphertext: String,
    ciphertext_self: Option<String>,
    edit_count: u32,
) -> BoxFuture<'static, Ready> {
    async move {
        let decrypted = pipeline.decrypt(request).await;
        Ready::Edit {
            dialog_id,
            id,
            ciphertext,
            ciphertext_self,
            edit_count,
            text: decrypted.text,
        }
    }
    .boxed()
}

fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn message_from_wire(wire: WireMessage, status: Option<MessageStatus>) -> Message {
    let mut merged = wire.status.unwrap_or(MessageStatus::Sent);
    if let Some(status) = status {
        merged = merged.merge(status);
    }
    Message {
        id: wire.id,
        dialog_id: wire.dialog_hash,
        sender: wire.sender,
        recipient: wire.recipient,
        ciphertext: wire.ciphertext,
        ciphertext_self: wire.ciphertext_self,
        timestamp: timestamp_from_millis(wire.timestamp),
        status: merged,
        plaintext: None,
        reply_to: wire.reply_to,
        reply_preview: None,
        edited: false,
        edit_count: 0,
        reactions: Default::default(),
        attachment_ref: wire.attachment_ref,
        tx_id: wire.tx_id,
    }
}

/// Room traffic is not end-to-end encrypted; the content is the text.
fn room_candidate(wire: RoomWireMessage) -> (Message, AdmitOptions) {
    let opts = AdmitOptions {
        silent: wire.catch_up,
        echo_of: wire.temp_id,
    };
    let message = Message {
        id: wire.id,
        dialog_id: DialogId::room(&wire.room_id),
        sender: wire.sender,
        recipient: None,
        ciphertext: wire.content.clone(),
        ciphertext_self: None,
        timestamp: timestamp_from_millis(wire.timestamp),
        status: MessageStatus::Sent,
        plaintext: Some(wire.content),
        reply_to: wire.reply_to,
        reply_preview: None,
        edited: false,
        edit_count: 0,
        reactions: Default::default(),
        attachment_ref: None,
        tx_id: None,
    };
    (message, opts)
}
