mod chat_list;
mod config;
pub mod message_log;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
mod session;
pub mod typing;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use flume::Sender;

use crate::actions::AppAction;
use crate::cache::LocalCache;
use crate::error::SyncError;
use crate::identity::{addresses_match, is_valid_contact_address, normalize_address};
use crate::relay::{RelayConnector, RelayEvent, RelayFrame, RelayMessage, WsRelayConnector};
use crate::state::{now_millis, ActivationNotice, AuthState, Conversation, Message, MessageKind};
use crate::store::{ConversationDoc, DocumentStore, MessageDoc, SqliteDocumentStore, StoreSnapshot};
use crate::timeline::LabelClock;
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use reconcile::{Draft, Reconciler, RelayDisposition};
use scheduler::Scheduler;
use session::Session;
use typing::TypingEffect;

/// Externally supplied relay and store. Anything left `None` is built from
/// the config at startup.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub relay: Option<Arc<dyn RelayConnector>>,
    pub store: Option<Arc<dyn DocumentStore>>,
}

pub struct AppCore {
    pub state: crate::state::AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<crate::state::AppState>>,

    data_dir: String,
    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    relay_connector: Option<Arc<dyn RelayConnector>>,
    store: Option<Arc<dyn DocumentStore>>,
    cache: LocalCache,
    clock: LabelClock,
    scheduler: Scheduler,

    session: Option<Session>,
    shut_down: bool,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<crate::state::AppState>>,
        collaborators: Collaborators,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = crate::state::AppState::empty();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let clock = match config.utc_offset_minutes {
            Some(offset) => LabelClock::new(offset),
            None => LabelClock::local(),
        };
        let scheduler = Scheduler::new(config.scheduler_interval_ms());
        let cache = LocalCache::new(&data_dir);

        let mut this = Self {
            state,
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            data_dir,
            config,
            runtime,
            relay_connector: None,
            store: None,
            cache,
            clock,
            scheduler,
            session: None,
            shut_down: false,
        };

        this.relay_connector = match collaborators.relay {
            Some(relay) if this.config.disable_network != Some(true) => Some(relay),
            Some(_) => None,
            None if this.network_enabled() => this
                .config
                .relay_url()
                .map(|url| Arc::new(WsRelayConnector::new(url)) as Arc<dyn RelayConnector>),
            None => None,
        };
        this.store = match collaborators.store {
            Some(store) => Some(store),
            None => {
                let path = this.config.store_path(&this.data_dir);
                match SqliteDocumentStore::open(&path) {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn DocumentStore>),
                    Err(e) => {
                        tracing::warn!(%e, path = %path.display(), "document store unavailable; running without persistence");
                        None
                    }
                }
            }
        };
        tracing::info!(
            relay = this.relay_connector.is_some(),
            store = this.store.is_some(),
            "core ready"
        );

        // Ensure ChatApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &crate::state::AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    /// Re-project, write the cache and publish. Every state-changing step ends here.
    fn sync_view(&mut self) {
        self.refresh_projection();
        self.save_cache();
        self.emit_state();
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Stays in state until the UI clears it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        if self.shut_down {
            return;
        }
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it carries message bodies.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::Relay(event) => self.handle_relay_event(event),
            InternalEvent::Snapshot(snapshot) => self.handle_snapshot(snapshot),
            InternalEvent::PersistResult {
                chat_id,
                message_id,
                error,
            } => {
                let Some(reason) = error else {
                    tracing::debug!(chat_id = %chat_id, message_id = %message_id, "message persisted");
                    return;
                };
                let Some(sess) = self.session.as_mut() else {
                    return;
                };
                sess.log.mark_local_only(&message_id);
                let err = SyncError::DurablePersistFailed { message_id, reason };
                tracing::warn!(%err, chat_id = %chat_id, "persist failed");
                self.toast(err.to_string());
            }
            InternalEvent::Toast(msg) => self.toast(msg),
            InternalEvent::TypingTimerFired {
                chat_id,
                generation,
            } => {
                let Some(sess) = self.session.as_mut() else {
                    return;
                };
                let effects = sess.typing.on_timer_fired(&chat_id, generation);
                self.run_typing_effects(effects);
            }
            InternalEvent::SchedulerTick => self.handle_scheduler_tick(),
            InternalEvent::Shutdown { done } => {
                tracing::info!("shutdown");
                self.stop_session();
                self.shut_down = true;
                let _ = done.send(());
            }
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        match event {
            RelayEvent::Connected => tracing::info!("relay connected"),
            RelayEvent::Disconnected => {
                tracing::info!("relay disconnected");
                if sess.typing.on_relay_disconnected() {
                    self.sync_view();
                }
            }
            RelayEvent::Frame(RelayFrame::ReceiveMessage(payload)) => {
                let active = sess.active_chat.clone();
                let disposition = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
                    .accept_relay_message(&payload, active.as_deref(), now_millis());
                match disposition {
                    RelayDisposition::Inserted { chat_id, created } => {
                        tracing::debug!(chat_id = %chat_id, created, "relay: message received");
                        self.sync_view();
                    }
                    other => tracing::debug!(disposition = ?other, "relay: message not inserted"),
                }
            }
            RelayEvent::Frame(RelayFrame::UserTyping(signal)) => {
                if sess.typing.on_inbound(&signal, true) {
                    self.sync_view();
                }
            }
            RelayEvent::Frame(RelayFrame::UserStopTyping(signal)) => {
                if sess.typing.on_inbound(&signal, false) {
                    self.sync_view();
                }
            }
            RelayEvent::Frame(frame) => {
                tracing::debug!(event = frame.tag(), "relay: ignoring client-side frame");
            }
        }
    }

    fn handle_snapshot(&mut self, snapshot: StoreSnapshot) {
        let grace = self.config.snapshot_grace_ms();
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        match snapshot {
            StoreSnapshot::Conversations { watch, docs } => {
                if sess.conversations_watch != Some(watch) {
                    tracing::debug!(watch, "stale conversation snapshot");
                    return;
                }
                let merge = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
                    .apply_conversation_snapshot(&docs);
                let rekeyed_active = sess.active_chat.as_ref().and_then(|active| {
                    merge
                        .rekeyed
                        .iter()
                        .find(|(old, _)| old == active)
                        .map(|(_, new)| new.clone())
                });
                if let Some(new_id) = rekeyed_active {
                    sess.active_chat = Some(new_id.clone());
                    self.watch_messages(&new_id);
                }
                for (from, into) in merge.superseded {
                    self.fold_duplicate_conversation(from, into);
                }
                self.sync_view();
            }
            StoreSnapshot::Messages {
                watch,
                chat_id,
                docs,
            } => {
                let current = sess.messages_watch.as_ref().map(|(c, w)| (c.as_str(), *w));
                if current != Some((chat_id.as_str(), watch)) {
                    tracing::debug!(watch, chat_id = %chat_id, "stale message snapshot");
                    return;
                }
                Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log).apply_message_snapshot(
                    &chat_id,
                    docs,
                    now_millis(),
                    grace,
                );
                self.sync_view();
            }
        }
    }

    fn handle_scheduler_tick(&mut self) {
        let tones = self.config.conversation_tones();
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let activations = self
            .scheduler
            .tick(&mut sess.log, &mut sess.registry, now_millis());
        let Some(last) = activations.last() else {
            return;
        };
        if tones {
            self.state.activation_notice = Some(ActivationNotice {
                chat_id: last.chat_id.clone(),
                message_id: last.message_id.clone(),
            });
        }
        self.sync_view();
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::Login {
                address,
                display_name,
            } => {
                let address = address.trim().to_string();
                if normalize_address(&address).is_empty() {
                    self.toast(SyncError::InvalidAddress(address).to_string());
                    return;
                }
                self.start_session(address, display_name);
            }
            AppAction::Logout => {
                self.stop_session();
                let rev = self.state.rev;
                self.state = crate::state::AppState::empty();
                self.state.rev = rev;
                self.emit_state();
            }

            // UI
            AppAction::SetChatListView { view, query } => {
                self.state.chat_list_view = view;
                self.state.search_query = query;
                self.sync_view();
            }
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
            AppAction::ClearActivationNotice => {
                if self.state.activation_notice.take().is_some() {
                    self.emit_state();
                }
            }

            other => {
                if self.session.is_none() {
                    self.toast(SyncError::NotLoggedIn.to_string());
                    return;
                }
                if let Err(e) = self.handle_session_action(other) {
                    tracing::info!(%e, "action rejected");
                    self.toast(e.to_string());
                }
            }
        }
    }

    fn handle_session_action(&mut self, action: AppAction) -> Result<(), SyncError> {
        let sess = self.session.as_mut().ok_or(SyncError::NotLoggedIn)?;
        let now = now_millis();
        match action {
            AppAction::AddContact { name, address } => self.add_contact(name, address),
            AppAction::CreateGroup {
                name,
                member_chat_ids,
            } => self.create_group(name, member_chat_ids),
            AppAction::OpenChat { chat_id } => {
                if !sess.registry.contains(&chat_id) {
                    return Err(SyncError::ConversationNotFound(chat_id));
                }
                self.switch_active_chat(Some(chat_id));
                Ok(())
            }
            AppAction::CloseChat => {
                self.switch_active_chat(None);
                Ok(())
            }
            AppAction::SetChatFlag {
                chat_id,
                flag,
                value,
            } => {
                sess.registry.set_flag(&chat_id, flag, value)?;
                self.sync_view();
                Ok(())
            }
            AppAction::ToggleUnread { chat_id } => {
                sess.registry.toggle_unread(&chat_id)?;
                self.sync_view();
                Ok(())
            }
            AppAction::SetWallpaper { chat_id, wallpaper } => {
                sess.registry.set_wallpaper(&chat_id, wallpaper)?;
                self.sync_view();
                Ok(())
            }
            AppAction::ResetLocks => {
                let cleared = sess.registry.reset_locks();
                tracing::info!(cleared, "locks reset");
                self.sync_view();
                Ok(())
            }
            AppAction::DeleteChat { chat_id } => self.delete_chat(chat_id),
            AppAction::SendMessage {
                chat_id,
                content,
                kind,
                quoted_message_id,
            } => {
                let draft = Draft {
                    chat_id,
                    body: content,
                    kind,
                    quoted_message_id,
                    scheduled_for: None,
                };
                let msg = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
                    .accept_local_send(draft, now)?;
                self.after_local_send(&msg);
                self.sync_view();
                Ok(())
            }
            AppAction::ScheduleMessage {
                chat_id,
                content,
                scheduled_for,
            } => {
                let draft = Draft {
                    chat_id,
                    body: content,
                    kind: MessageKind::Text,
                    quoted_message_id: None,
                    scheduled_for: Some(scheduled_for),
                };
                let msg = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
                    .accept_local_send(draft, now)?;
                tracing::info!(chat_id = %msg.conversation_id, message_id = %msg.id, scheduled_for, "message scheduled");
                self.sync_view();
                Ok(())
            }
            AppAction::SendToMany { chat_ids, content } => {
                let results = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
                    .send_to_many(&chat_ids, &content, now);
                let mut first_error = None;
                for result in results {
                    match result {
                        Ok(msg) => self.after_local_send(&msg),
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                self.sync_view();
                first_error.map_or(Ok(()), Err)
            }
            AppAction::ToggleReaction {
                chat_id,
                message_id,
                emoji,
            } => {
                sess.log.toggle_reaction(&chat_id, &message_id, &emoji)?;
                self.sync_view();
                Ok(())
            }
            AppAction::ComposeChanged { chat_id, text } => {
                let receiver = sess
                    .registry
                    .get(&chat_id)
                    .filter(|c| !c.is_group && !c.blocked)
                    .map(|c| c.counterparty_address.clone());
                let effects = sess
                    .typing
                    .on_compose_changed(&chat_id, receiver.as_deref(), &text);
                self.run_typing_effects(effects);
                Ok(())
            }
            AppAction::Login { .. }
            | AppAction::Logout
            | AppAction::SetChatListView { .. }
            | AppAction::ClearToast
            | AppAction::ClearActivationNotice => Ok(()),
        }
    }

    fn add_contact(&mut self, name: String, address: String) -> Result<(), SyncError> {
        let sess = self.session.as_mut().ok_or(SyncError::NotLoggedIn)?;
        let address = address.trim().to_string();
        if !is_valid_contact_address(&address) || sess.me.is_me(&address) {
            return Err(SyncError::InvalidAddress(address));
        }
        let existing = sess
            .registry
            .all()
            .iter()
            .find(|c| !c.is_group && addresses_match(&c.counterparty_address, &address))
            .map(|c| c.id.clone());
        // The other side may have created the conversation already.
        let stored = match (existing.is_some(), self.store.as_ref()) {
            (false, Some(store)) => match store.find_direct_conversation(&sess.me.address, &address) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(%e, "store: direct conversation lookup failed");
                    None
                }
            },
            _ => None,
        };
        let chat_id = match (existing, stored) {
            (Some(id), _) => id,
            (None, Some(doc)) => {
                tracing::info!(chat_id = %doc.id, "add contact: reusing stored conversation");
                sess.registry.create(doc.to_conversation(&sess.me.address));
                doc.id
            }
            (None, None) => {
                let name = match name.trim() {
                    "" => address.clone(),
                    n => n.to_string(),
                };
                let chat = Conversation::direct(
                    uuid::Uuid::new_v4().to_string(),
                    name,
                    address,
                    now_millis(),
                );
                let id = chat.id.clone();
                sess.registry.create(chat);
                self.persist_conversation(&id);
                id
            }
        };
        self.switch_active_chat(Some(chat_id));
        Ok(())
    }

    fn create_group(&mut self, name: String, member_chat_ids: Vec<String>) -> Result<(), SyncError> {
        let sess = self.session.as_mut().ok_or(SyncError::NotLoggedIn)?;
        let name = name.trim().to_string();
        let mut members: Vec<String> = Vec::new();
        for chat_id in &member_chat_ids {
            let chat = sess
                .registry
                .get(chat_id)
                .ok_or_else(|| SyncError::ConversationNotFound(chat_id.clone()))?;
            if chat.is_group {
                continue;
            }
            if !members.iter().any(|m| addresses_match(m, &chat.counterparty_address)) {
                members.push(chat.counterparty_address.clone());
            }
        }
        if name.is_empty() || members.is_empty() {
            return Err(SyncError::InvalidAddress(name));
        }

        let mut chat = Conversation::direct(
            uuid::Uuid::new_v4().to_string(),
            name,
            String::new(),
            now_millis(),
        );
        chat.is_group = true;
        chat.participants = members;
        let id = chat.id.clone();
        tracing::info!(chat_id = %id, members = chat.participants.len(), "group created");
        sess.registry.create(chat);
        self.persist_conversation(&id);
        self.switch_active_chat(Some(id));
        Ok(())
    }

    fn delete_chat(&mut self, chat_id: String) -> Result<(), SyncError> {
        let sess = self.session.as_mut().ok_or(SyncError::NotLoggedIn)?;
        let removed = Reconciler::new(&sess.me, &mut sess.registry, &mut sess.log)
            .remove_conversation(&chat_id)?;
        tracing::info!(chat_id = %chat_id, removed, "conversation deleted");
        if sess.active_chat.as_deref() == Some(chat_id.as_str()) {
            self.switch_active_chat(None);
        }
        if let Some(store) = self.store.clone() {
            let tx = self.core_sender.clone();
            self.runtime.spawn_blocking(move || {
                if let Err(e) = store.delete_conversation(&chat_id) {
                    tracing::warn!(%e, chat_id = %chat_id, "store: delete failed");
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Toast(format!(
                        "Could not delete chat: {e}"
                    )))));
                }
            });
        }
        self.sync_view();
        Ok(())
    }

    /// Move a duplicate direct conversation's messages into the canonical one
    /// in the store. Both participants may race to do this; it is idempotent.
    fn fold_duplicate_conversation(&self, from: String, into: String) {
        let Some(store) = self.store.clone() else {
            return;
        };
        self.runtime.spawn_blocking(move || {
            if let Err(e) = store.merge_conversation(&from, &into) {
                tracing::warn!(%e, from = %from, into = %into, "store: conversation merge failed");
            }
        });
    }

    /// Switch the viewed conversation: stop typing in the old one, clear unread
    /// in the new one and point the message watch at it.
    fn switch_active_chat(&mut self, next: Option<String>) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let previous = sess.active_chat.clone();
        if previous != next {
            let effects = sess.typing.on_active_chat_changed(previous.as_deref());
            sess.active_chat = next.clone();
            self.run_typing_effects(effects);
        }
        match next {
            Some(chat_id) => {
                if let Some(sess) = self.session.as_mut() {
                    if let Err(e) = sess.registry.mark_read(&chat_id) {
                        tracing::debug!(%e, "mark_read");
                    }
                }
                self.watch_messages(&chat_id);
            }
            None => self.unwatch_messages(),
        }
        self.sync_view();
    }

    fn after_local_send(&mut self, msg: &Message) {
        self.publish(RelayFrame::SendMessage(RelayMessage::from_message(msg)));
        self.persist_message(msg);
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let effects = sess
            .typing
            .on_compose_changed(&msg.conversation_id, None, "");
        self.run_typing_effects(effects);
    }

    fn publish(&self, frame: RelayFrame) {
        let Some(relay) = self.session.as_ref().and_then(|s| s.relay.clone()) else {
            return;
        };
        let event = frame.tag();
        if let Err(e) = relay.publish(frame) {
            tracing::debug!(%e, event, "relay publish dropped");
        }
    }

    fn run_typing_effects(&mut self, effects: Vec<TypingEffect>) {
        for effect in effects {
            match effect {
                TypingEffect::Emit(frame) => self.publish(frame),
                TypingEffect::ArmTimer {
                    chat_id,
                    generation,
                } => {
                    let tx = self.core_sender.clone();
                    let idle = Duration::from_millis(self.config.typing_idle_ms());
                    self.runtime.spawn(async move {
                        tokio::time::sleep(idle).await;
                        let _ = tx.send(CoreMsg::Internal(Box::new(
                            InternalEvent::TypingTimerFired {
                                chat_id,
                                generation,
                            },
                        )));
                    });
                }
            }
        }
    }

    fn conversation_doc(&self, chat_id: &str) -> Option<ConversationDoc> {
        let sess = self.session.as_ref()?;
        let chat = sess.registry.get(chat_id)?;
        Some(ConversationDoc::from_conversation(
            chat,
            &sess.me.address,
            &sess.me.display_name,
        ))
    }

    fn persist_conversation(&self, chat_id: &str) {
        let (Some(store), Some(doc)) = (self.store.clone(), self.conversation_doc(chat_id)) else {
            return;
        };
        let tx = self.core_sender.clone();
        self.runtime.spawn_blocking(move || {
            if let Err(e) = store.upsert_conversation(&doc) {
                tracing::warn!(%e, chat_id = %doc.id, "store: conversation upsert failed");
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Toast(format!(
                    "Could not save chat: {e}"
                )))));
            }
        });
    }

    /// Conversation upsert, message write and preview update, off the actor
    /// thread. The outcome comes back as `PersistResult`.
    fn persist_message(&self, msg: &Message) {
        let (Some(store), Some(conversation)) =
            (self.store.clone(), self.conversation_doc(&msg.conversation_id))
        else {
            return;
        };
        let doc = MessageDoc::from_message(msg);
        let preview = msg.preview();
        let at = msg.created_at;
        let chat_id = msg.conversation_id.clone();
        let message_id = msg.id.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn_blocking(move || {
            let res = store
                .upsert_conversation(&conversation)
                .and_then(|_| store.write_message(&chat_id, &doc))
                .and_then(|_| store.update_preview(&chat_id, &preview, at));
            let error = res.err().map(|e| e.to_string());
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::PersistResult {
                chat_id,
                message_id,
                error,
            })));
        });
    }

    fn save_cache(&self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = self.cache.save(
            &sess.me.address,
            sess.registry.all(),
            sess.log.logs(),
            sess.log.outbox(),
            &sess.profile(),
        ) {
            tracing::warn!(%e, "cache write failed");
        }
    }

    fn logged_in_auth(&self) -> AuthState {
        match self.session.as_ref() {
            Some(sess) => AuthState::LoggedIn {
                address: sess.me.address.clone(),
                display_name: sess.me.display_name.clone(),
            },
            None => AuthState::LoggedOut,
        }
    }
}
