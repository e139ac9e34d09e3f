mod actions;
mod cache;
mod core;
mod error;
mod identity;
mod logging;
mod relay;
mod state;
mod store;
mod timeline;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use cache::{CachedProfile, CachedSession, LocalCache};
pub use crate::core::message_log::{InsertOutcome, LocalEntry, MessageLog};
pub use crate::core::reconcile::{Draft, LocalIdentity, Reconciler, RelayDisposition};
pub use crate::core::registry::{ConversationRegistry, SnapshotMerge, UpsertOutcome};
pub use crate::core::scheduler::{Activation, Scheduler};
pub use crate::core::typing::{TypingEffect, TypingMachine};
pub use crate::core::Collaborators;
pub use error::{CacheError, RelayError, StoreError, SyncError};
pub use identity::*;
pub use relay::{
    LoopbackHub, RelayConnector, RelayEvent, RelayFrame, RelayMessage, RelayQuote, RelaySink,
    RelayTransport, TypingSignal, WsRelayConnector,
};
pub use state::*;
pub use store::{
    ConversationDoc, DocumentStore, MessageDoc, SnapshotSink, SqliteDocumentStore, StoreSnapshot,
    WatchId,
};
pub use timeline::LabelClock;
pub use updates::*;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct ChatApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

#[uniffi::export]
impl ChatApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        Self::with_collaborators(data_dir, Collaborators::default())
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Emit final stop-typing signals, close the relay and stop the actor.
    /// Blocks until the actor has finished or a short timeout passes.
    pub fn shutdown(&self) {
        let (done_tx, done_rx) = flume::bounded(1);
        let sent = self
            .core_tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::Shutdown {
                done: done_tx,
            })));
        if sent.is_ok() && done_rx.recv_timeout(SHUTDOWN_WAIT).is_err() {
            tracing::warn!("shutdown: actor did not confirm in time");
        }
    }
}

impl ChatApp {
    /// Like [`ChatApp::new`], with an injected relay and/or store. Used by
    /// tests and embedders that share one store between several apps.
    pub fn with_collaborators(data_dir: String, collaborators: Collaborators) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "ChatApp::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                collaborators,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
                if core.is_shut_down() {
                    break;
                }
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        })
    }
}
