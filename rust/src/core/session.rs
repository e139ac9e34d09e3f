// Session lifecycle: relay connection, store watches and the scheduler loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{CachedProfile, CachedSession};
use crate::identity::is_implicit_chat_id;
use crate::relay::{RelaySink, RelayTransport};
use crate::state::now_millis;
use crate::store::{SnapshotSink, WatchId};
use crate::updates::{CoreMsg, InternalEvent};

use super::message_log::MessageLog;
use super::reconcile::LocalIdentity;
use super::registry::ConversationRegistry;
use super::typing::{TypingEffect, TypingMachine};
use super::AppCore;

pub(super) struct Session {
    pub(super) me: LocalIdentity,
    pub(super) registry: ConversationRegistry,
    pub(super) log: MessageLog,
    pub(super) typing: TypingMachine,
    pub(super) relay: Option<Arc<dyn RelayTransport>>,
    // Cleared on logout; async callbacks check it before posting back.
    pub(super) alive: Arc<AtomicBool>,
    pub(super) conversations_watch: Option<WatchId>,
    pub(super) messages_watch: Option<(String, WatchId)>,
    pub(super) active_chat: Option<String>,
}

impl Session {
    pub(super) fn profile(&self) -> CachedProfile {
        CachedProfile {
            address: self.me.address.clone(),
            display_name: self.me.display_name.clone(),
        }
    }
}

impl AppCore {
    pub(super) fn start_session(&mut self, address: String, display_name: String) {
        // Tear down any existing session first.
        self.stop_session();

        let cached = match self.cache.load(&address) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(%e, "cache unreadable; starting empty");
                CachedSession::default()
            }
        };
        let display_name = match display_name.trim() {
            "" => cached
                .profile
                .as_ref()
                .map(|p| p.display_name.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| address.clone()),
            name => name.to_string(),
        };
        tracing::info!(
            address = %address,
            cached_chats = cached.chats.len(),
            "start_session"
        );

        let now = now_millis();
        let mut log = MessageLog::from_logs(cached.messages);
        log.restore_outbox(cached.outbox);
        // Scheduled messages never reach the store; snapshots must not drop them.
        for (_, message_id, _) in log.pending() {
            if log.local_entry(&message_id).is_none() {
                log.track_local(&message_id, now, false);
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let relay = self.relay_connector.clone().map(|connector| {
            let tx = self.core_sender.clone();
            let alive = alive.clone();
            let sink: RelaySink = Arc::new(move |event| {
                if alive.load(Ordering::SeqCst) {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Relay(event))));
                }
            });
            connector.connect(self.runtime.handle(), sink)
        });
        if relay.is_none() {
            tracing::info!("no relay configured; live delivery disabled");
        }

        let typing = TypingMachine::new(&address);
        self.session = Some(Session {
            me: LocalIdentity::new(address, display_name),
            registry: ConversationRegistry::from_conversations(cached.chats),
            log,
            typing,
            relay,
            alive,
            conversations_watch: None,
            messages_watch: None,
            active_chat: None,
        });

        self.watch_conversations();
        self.start_scheduler_loop();
        self.sync_view();
    }

    pub(super) fn stop_session(&mut self) {
        self.save_cache();
        let Some(mut sess) = self.session.take() else {
            return;
        };
        tracing::info!(address = %sess.me.address, "stop_session");

        sess.alive.store(false, Ordering::SeqCst);
        let effects = sess.typing.on_shutdown();
        if let Some(relay) = sess.relay.take() {
            for effect in effects {
                if let TypingEffect::Emit(frame) = effect {
                    let _ = relay.publish(frame);
                }
            }
            relay.close();
        }
        if let Some(store) = self.store.as_ref() {
            if let Some(watch) = sess.conversations_watch.take() {
                store.unwatch(watch);
            }
            if let Some((_, watch)) = sess.messages_watch.take() {
                store.unwatch(watch);
            }
        }
    }

    fn snapshot_sink(&self, alive: Arc<AtomicBool>) -> SnapshotSink {
        let tx = self.core_sender.clone();
        Arc::new(move |snapshot| {
            if alive.load(Ordering::SeqCst) {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Snapshot(snapshot))));
            }
        })
    }

    fn watch_conversations(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let identity = sess.me.address.clone();
        let sink = self.snapshot_sink(sess.alive.clone());
        match store.watch_conversations(&identity, sink) {
            Ok(watch) => {
                if let Some(sess) = self.session.as_mut() {
                    sess.conversations_watch = Some(watch);
                }
            }
            Err(e) => {
                tracing::warn!(%e, "watch_conversations failed");
                self.toast(format!("Could not load chats: {e}"));
            }
        }
    }

    /// Point the message watch at `chat_id`. A no-op if it already is.
    pub(super) fn watch_messages(&mut self, chat_id: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess
            .messages_watch
            .as_ref()
            .is_some_and(|(current, _)| current == chat_id)
        {
            return;
        }
        if let Some((_, old)) = sess.messages_watch.take() {
            store.unwatch(old);
        }
        // Implicit conversations have no store document until they are re-keyed.
        if is_implicit_chat_id(chat_id) {
            return;
        }
        let alive = sess.alive.clone();
        let sink = self.snapshot_sink(alive);
        match store.watch_messages(chat_id, sink) {
            Ok(watch) => {
                if let Some(sess) = self.session.as_mut() {
                    sess.messages_watch = Some((chat_id.to_string(), watch));
                }
            }
            Err(e) => {
                tracing::warn!(%e, chat_id, "watch_messages failed");
                self.toast(format!("Could not load messages: {e}"));
            }
        }
    }

    pub(super) fn unwatch_messages(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if let Some((_, watch)) = sess.messages_watch.take() {
            if let Some(store) = self.store.as_ref() {
                store.unwatch(watch);
            }
        }
    }

    fn start_scheduler_loop(&self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let alive = sess.alive.clone();
        let tx = self.core_sender.clone();
        let period = self.scheduler.interval();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if tx
                    .send(CoreMsg::Internal(Box::new(InternalEvent::SchedulerTick)))
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}
