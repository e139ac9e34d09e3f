// Per-conversation message logs, keyed by message id.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::state::{Message, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateIgnored,
}

/// Bookkeeping for a message the store has not confirmed yet: local sends and
/// messages that arrived over the relay ahead of the sender's write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub accepted_at: i64,
    /// False when the durable store will never see the message (scheduled
    /// sends, failed writes).
    pub durable: bool,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    logs: HashMap<String, Vec<Message>>,
    outbox: HashMap<String, LocalEntry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, chat_id: &str) -> &[Message] {
        self.logs.get(chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, chat_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(chat_id).iter().find(|m| m.id == message_id)
    }

    pub fn contains(&self, chat_id: &str, message_id: &str) -> bool {
        self.get(chat_id, message_id).is_some()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &str> {
        self.logs.keys().map(String::as_str)
    }

    /// Idempotent by id. Ordered by `created_at`; equal timestamps keep
    /// arrival order.
    pub fn insert(&mut self, chat_id: &str, message: Message) -> InsertOutcome {
        let log = self.logs.entry(chat_id.to_string()).or_default();
        if log.iter().any(|m| m.id == message.id) {
            return InsertOutcome::DuplicateIgnored;
        }
        insert_ordered(log, message);
        InsertOutcome::Inserted
    }

    /// Replace one conversation's log with a store snapshot.
    ///
    /// Messages absent from the snapshot survive only if `retain` says so.
    /// Local-only fields (reactions) carry over by id. Outbox entries for ids
    /// the snapshot contains are dropped.
    pub fn replace_from_snapshot<F>(&mut self, chat_id: &str, snapshot: Vec<Message>, retain: F) -> usize
    where
        F: Fn(&Message) -> bool,
    {
        let previous = self.logs.remove(chat_id).unwrap_or_default();
        let snapshot_ids: HashSet<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
        let reactions: HashMap<&str, &String> = previous
            .iter()
            .filter_map(|m| m.reaction.as_ref().map(|r| (m.id.as_str(), r)))
            .collect();

        let mut next: Vec<Message> = Vec::with_capacity(snapshot.len());
        for mut msg in snapshot.iter().cloned() {
            if next.iter().any(|m| m.id == msg.id) {
                continue;
            }
            if msg.reaction.is_none() {
                msg.reaction = reactions.get(msg.id.as_str()).map(|r| (*r).clone());
            }
            insert_ordered(&mut next, msg);
        }

        let mut retained = 0;
        for msg in previous.iter() {
            if !snapshot_ids.contains(msg.id.as_str()) && retain(msg) {
                insert_ordered(&mut next, msg.clone());
                retained += 1;
            }
        }

        for id in &snapshot_ids {
            self.outbox.remove(*id);
        }
        self.logs.insert(chat_id.to_string(), next);
        retained
    }

    pub fn remove_conversation(&mut self, chat_id: &str) -> usize {
        let Some(removed) = self.logs.remove(chat_id) else {
            return 0;
        };
        for msg in &removed {
            self.outbox.remove(&msg.id);
        }
        removed.len()
    }

    /// Move a partition to a new conversation id, merging by id if the target
    /// already has messages.
    pub fn rename_conversation(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let Some(moved) = self.logs.remove(old) else {
            return;
        };
        for mut msg in moved {
            msg.conversation_id = new.to_string();
            self.insert(new, msg);
        }
    }

    /// Heart-style toggle: same emoji clears, anything else replaces.
    pub fn toggle_reaction(&mut self, chat_id: &str, message_id: &str, emoji: &str) -> Result<Option<String>, SyncError> {
        let msg = self
            .logs
            .get_mut(chat_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| SyncError::MessageNotFound {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        msg.reaction = match msg.reaction.as_deref() {
            Some(current) if current == emoji => None,
            _ => Some(emoji.to_string()),
        };
        Ok(msg.reaction.clone())
    }

    /// Every pending message as (chat_id, message_id, scheduled_for).
    pub fn pending(&self) -> Vec<(String, String, i64)> {
        let mut out = Vec::new();
        for (chat_id, log) in &self.logs {
            for msg in log.iter().filter(|m| m.is_pending()) {
                out.push((chat_id.clone(), msg.id.clone(), msg.scheduled_for.unwrap_or(i64::MAX)));
            }
        }
        out.sort_by_key(|(_, _, at)| *at);
        out
    }

    /// Pending -> Sent, with the display time moved to `now`. Returns false for
    /// anything that is not pending, so repeated activation is a no-op.
    pub fn activate(&mut self, chat_id: &str, message_id: &str, now: i64) -> bool {
        let Some(log) = self.logs.get_mut(chat_id) else {
            return false;
        };
        let Some(idx) = log.iter().position(|m| m.id == message_id && m.is_pending()) else {
            return false;
        };
        let mut msg = log.remove(idx);
        msg.status = MessageStatus::Sent;
        msg.created_at = now;
        insert_ordered(log, msg);
        true
    }

    pub fn track_local(&mut self, message_id: &str, accepted_at: i64, durable: bool) {
        self.outbox.insert(message_id.to_string(), LocalEntry { accepted_at, durable });
    }

    /// The durable write will not happen; keep the message through snapshots.
    pub fn mark_local_only(&mut self, message_id: &str) {
        if let Some(entry) = self.outbox.get_mut(message_id) {
            entry.durable = false;
        }
    }

    pub fn local_entry(&self, message_id: &str) -> Option<LocalEntry> {
        self.outbox.get(message_id).copied()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn outbox(&self) -> &HashMap<String, LocalEntry> {
        &self.outbox
    }

    /// Re-attach saved outbox entries. Entries for messages no longer in any
    /// log are dropped.
    pub fn restore_outbox(&mut self, entries: HashMap<String, LocalEntry>) {
        let known: HashSet<&str> = self
            .logs
            .values()
            .flat_map(|log| log.iter().map(|m| m.id.as_str()))
            .collect();
        let restored: Vec<(String, LocalEntry)> = entries
            .into_iter()
            .filter(|(id, _)| known.contains(id.as_str()))
            .collect();
        self.outbox.extend(restored);
    }

    pub fn into_logs(self) -> HashMap<String, Vec<Message>> {
        self.logs
    }

    pub fn from_logs(logs: HashMap<String, Vec<Message>>) -> Self {
        let mut out = Self::new();
        for (chat_id, messages) in logs {
            for msg in messages {
                out.insert(&chat_id, msg);
            }
        }
        out
    }

    pub fn logs(&self) -> &HashMap<String, Vec<Message>> {
        &self.logs
    }
}

fn insert_ordered(log: &mut Vec<Message>, message: Message) {
    let idx = log.partition_point(|m| m.created_at <= message.created_at);
    log.insert(idx, message);
}
