use crate::relay::RelayEvent;
use crate::state::AppState;
use crate::store::{StoreSnapshot, WatchId};
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Relay receive path
    Relay(RelayEvent),

    // Durable store live queries
    Snapshot(StoreSnapshot),

    // Async results
    PersistResult {
        chat_id: String,
        message_id: String,
        error: Option<String>,
    },
    Toast(String),

    // Timers
    TypingTimerFired {
        chat_id: String,
        generation: u64,
    },
    SchedulerTick,

    Shutdown {
        done: flume::Sender<()>,
    },
}

impl InternalEvent {
    pub fn watch(&self) -> Option<WatchId> {
        match self {
            InternalEvent::Snapshot(StoreSnapshot::Conversations { watch, .. })
            | InternalEvent::Snapshot(StoreSnapshot::Messages { watch, .. }) => Some(*watch),
            _ => None,
        }
    }
}
