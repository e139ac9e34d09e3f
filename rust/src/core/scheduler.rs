// Scheduled sends: a periodic tick reveals pending messages whose time has come.
// Activation is local only; nothing is sent to the relay or the store.

use super::message_log::MessageLog;
use super::registry::ConversationRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    interval_ms: u64,
}

impl Scheduler {
    pub const DEFAULT_INTERVAL_MS: u64 = 5_000;

    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }

    /// Activate every pending message due at `now`. Overlapping or repeated
    /// ticks are harmless: only a pending message can activate.
    pub fn tick(&self, log: &mut MessageLog, registry: &mut ConversationRegistry, now: i64) -> Vec<Activation> {
        let mut out = Vec::new();
        for (chat_id, message_id, due) in log.pending() {
            if due > now {
                continue;
            }
            if !log.activate(&chat_id, &message_id, now) {
                continue;
            }
            if let Some(msg) = log.get(&chat_id, &message_id) {
                let preview = msg.preview();
                if let Err(e) = registry.touch(&chat_id, &preview, now) {
                    tracing::debug!(%e, chat_id = %chat_id, "scheduler: activated message in unknown conversation");
                }
            }
            tracing::info!(chat_id = %chat_id, message_id = %message_id, "scheduled message activated");
            out.push(Activation { chat_id, message_id });
        }
        out
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL_MS)
    }
}
