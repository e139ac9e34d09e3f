use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::{
    AppAction, AppReconciler, AppState, AppUpdate, AuthState, ChatApp, ChatSummary, Collaborators,
    DocumentStore, LoopbackHub, SqliteDocumentStore,
};
use tempfile::TempDir;

pub fn wait_until(what: &str, timeout: Duration, f: impl FnMut() -> bool) {
    wait_until_with_poll(what, timeout, Duration::from_millis(100), f);
}

pub fn wait_until_with_poll(
    what: &str,
    timeout: Duration,
    poll: Duration,
    mut f: impl FnMut() -> bool,
) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(poll);
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// Write `courier_config.json`. `overrides` is merged over a deterministic base.
pub fn write_config(data_dir: &str, overrides: serde_json::Value) {
    let path = std::path::Path::new(data_dir).join("courier_config.json");
    let mut v = serde_json::json!({
        "disable_network": false,
        "utc_offset_minutes": 0,
    });
    if let (Some(base), Some(extra)) = (v.as_object_mut(), overrides.as_object()) {
        for (k, val) in extra {
            base.insert(k.clone(), val.clone());
        }
    }
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<AppUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn revs(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(AppUpdate::rev).collect()
    }

    pub fn last_toast(&self) -> Option<String> {
        self.0.lock().unwrap().iter().rev().find_map(|u| match u {
            AppUpdate::FullState(s) => s.toast.clone(),
        })
    }
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

pub struct TestApp {
    pub app: Arc<ChatApp>,
    pub collector: Collector,
    pub dir: TempDir,
}

impl TestApp {
    pub fn data_dir(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn state(&self) -> AppState {
        self.app.state()
    }

    pub fn dispatch(&self, action: AppAction) {
        self.app.dispatch(action);
    }

    pub fn login(&self, address: &str, name: &str) {
        self.dispatch(AppAction::Login {
            address: address.into(),
            display_name: name.into(),
        });
        wait_until("logged in", Duration::from_secs(5), || {
            matches!(self.state().auth, AuthState::LoggedIn { .. })
        });
    }

    pub fn chat_with(&self, counterparty: &str) -> Option<ChatSummary> {
        self.state()
            .chat_list
            .into_iter()
            .find(|c| courier_core::addresses_match(&c.counterparty_address, counterparty))
    }

    /// Add `address` as a contact and wait until its chat is open.
    pub fn open_contact(&self, name: &str, address: &str) -> String {
        self.dispatch(AppAction::AddContact {
            name: name.into(),
            address: address.into(),
        });
        wait_until("contact chat open", Duration::from_secs(5), || {
            self.state()
                .current_chat
                .is_some_and(|c| courier_core::addresses_match(&c.counterparty_address, address))
        });
        self.state().current_chat.map(|c| c.chat_id).unwrap()
    }
}

/// A logged-out app wired to `hub` and `store`, with `config` merged into the
/// test defaults.
pub fn spawn_app(
    hub: &LoopbackHub,
    store: &Arc<SqliteDocumentStore>,
    config: serde_json::Value,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_string_lossy().to_string();
    write_config(&data_dir, config);
    let store: Arc<dyn DocumentStore> = store.clone();
    let app = ChatApp::with_collaborators(
        data_dir,
        Collaborators {
            relay: Some(Arc::new(hub.clone())),
            store: Some(store),
        },
    );
    let collector = Collector::new();
    app.listen_for_updates(Box::new(collector.clone()));
    TestApp {
        app,
        collector,
        dir,
    }
}

pub fn shared_store() -> Arc<SqliteDocumentStore> {
    Arc::new(SqliteDocumentStore::open_in_memory().unwrap())
}
