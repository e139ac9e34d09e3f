//! Durable document store.
//!
//! Conversations and their nested message collections, delivered to watchers
//! as complete snapshots (never diffs) on subscribe and after every write that
//! touches the watched scope.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::{addresses_match, normalize_address};
use crate::state::{Conversation, Message, MessageDirection, MessageKind, MessageStatus, QuotedMessage};

pub type WatchId = u64;

/// Conversation document as stored. Participants are normalized addresses and
/// include the local identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDoc {
    pub id: String,
    /// Group name; for direct chats the name its creator gave the contact.
    pub name: String,
    pub participants: Vec<String>,
    /// Normalized address -> display name.
    pub participant_names: BTreeMap<String, String>,
    pub last_message: Option<String>,
    pub last_activity: i64,
    pub is_group: bool,
}

impl ConversationDoc {
    /// Store document for a local conversation, listing the local identity as a
    /// participant.
    pub fn from_conversation(chat: &Conversation, local_identity: &str, local_name: &str) -> Self {
        let me = normalize_address(local_identity);
        let mut participants = vec![me.clone()];
        for p in &chat.participants {
            let key = normalize_address(p);
            if !key.is_empty() && !participants.contains(&key) {
                participants.push(key);
            }
        }
        let mut participant_names = BTreeMap::new();
        participant_names.insert(me, local_name.to_string());
        if !chat.is_group {
            let key = normalize_address(&chat.counterparty_address);
            if !key.is_empty() {
                participant_names.insert(key, chat.display_name.clone());
            }
        }
        Self {
            id: chat.id.clone(),
            name: chat.display_name.clone(),
            participants,
            participant_names,
            last_message: chat.last_message_preview.clone(),
            last_activity: chat.last_activity,
            is_group: chat.is_group,
        }
    }

    fn counterparty(&self, local_identity: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| !addresses_match(p, local_identity))
    }

    /// Normalized counterparty address of a direct conversation.
    pub fn direct_key(&self, local_identity: &str) -> Option<String> {
        if self.is_group {
            return None;
        }
        self.counterparty(local_identity)
            .map(normalize_address)
            .filter(|k| !k.is_empty())
    }

    fn display_name_for(&self, local_identity: &str) -> String {
        if self.is_group {
            return self.name.clone();
        }
        self.counterparty(local_identity)
            .and_then(|c| self.participant_names.get(&normalize_address(c)))
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .or_else(|| self.counterparty(local_identity).map(str::to_string))
            .unwrap_or_else(|| self.name.clone())
    }

    fn others(&self, local_identity: &str) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| !addresses_match(p, local_identity))
            .cloned()
            .collect()
    }

    pub fn to_conversation(&self, local_identity: &str) -> Conversation {
        let counterparty = if self.is_group {
            String::new()
        } else {
            self.counterparty(local_identity).unwrap_or_default().to_string()
        };
        let mut chat = Conversation::direct(
            self.id.clone(),
            self.display_name_for(local_identity),
            counterparty,
            self.last_activity,
        );
        chat.participants = self.others(local_identity);
        chat.is_group = self.is_group;
        chat.last_message_preview = self.last_message.clone();
        chat
    }

    /// Overwrite the store-owned fields of `chat`.
    pub fn apply_to(&self, chat: &mut Conversation, local_identity: &str) {
        chat.display_name = self.display_name_for(local_identity);
        chat.participants = self.others(local_identity);
        chat.is_group = self.is_group;
        if !self.is_group {
            if let Some(c) = self.counterparty(local_identity) {
                if !addresses_match(&chat.counterparty_address, c) {
                    chat.counterparty_address = c.to_string();
                }
            }
        }
        if self.last_activity >= chat.last_activity {
            chat.last_message_preview = self.last_message.clone();
            chat.last_activity = self.last_activity;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDoc {
    pub id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: i64,
    pub quoted: Option<QuotedMessage>,
}

impl MessageDoc {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender_address: msg.sender_address.clone(),
            sender_name: msg.sender_name.clone(),
            body: msg.body.clone(),
            kind: msg.kind,
            created_at: msg.created_at,
            quoted: msg.quoted.clone(),
        }
    }

    /// Direction and status are derived from who sent it.
    pub fn into_message(self, chat_id: &str, local_identity: &str) -> Message {
        let mine = addresses_match(&self.sender_address, local_identity);
        Message {
            id: self.id,
            conversation_id: chat_id.to_string(),
            sender_address: self.sender_address,
            sender_name: self.sender_name,
            receiver_address: None,
            body: self.body,
            kind: self.kind,
            direction: if mine {
                MessageDirection::Sent
            } else {
                MessageDirection::Received
            },
            status: if mine {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
            created_at: self.created_at,
            scheduled_for: None,
            quoted: self.quoted,
            reaction: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreSnapshot {
    /// Every conversation the identity participates in, most recent first.
    Conversations {
        watch: WatchId,
        docs: Vec<ConversationDoc>,
    },
    /// Every message of one conversation, oldest first.
    Messages {
        watch: WatchId,
        chat_id: String,
        docs: Vec<MessageDoc>,
    },
}

pub type SnapshotSink = Arc<dyn Fn(StoreSnapshot) + Send + Sync>;

pub trait DocumentStore: Send + Sync {
    fn upsert_conversation(&self, doc: &ConversationDoc) -> Result<(), StoreError>;

    /// Returns false when a message with this id already exists.
    fn write_message(&self, chat_id: &str, doc: &MessageDoc) -> Result<bool, StoreError>;

    fn update_preview(&self, chat_id: &str, preview: &str, at: i64) -> Result<(), StoreError>;

    fn delete_conversation(&self, chat_id: &str) -> Result<(), StoreError>;

    /// Fold a duplicate conversation into `into`: its messages move over (by
    /// id), a newer preview wins and the duplicate is deleted. Idempotent.
    fn merge_conversation(&self, from: &str, into: &str) -> Result<(), StoreError>;

    /// The direct conversation between `identity` and `counterparty`, lowest id
    /// first when several exist.
    fn find_direct_conversation(&self, identity: &str, counterparty: &str) -> Result<Option<ConversationDoc>, StoreError>;

    fn watch_conversations(&self, identity: &str, sink: SnapshotSink) -> Result<WatchId, StoreError>;

    fn watch_messages(&self, chat_id: &str, sink: SnapshotSink) -> Result<WatchId, StoreError>;

    fn unwatch(&self, watch: WatchId);
}

enum Watcher {
    Conversations { identity: String, sink: SnapshotSink },
    Messages { chat_id: String, sink: SnapshotSink },
}

/// SQLite-backed [`DocumentStore`]. Cheap to share behind an `Arc`; several
/// sessions may watch the same store.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    watchers: Mutex<HashMap<WatchId, Watcher>>,
    // Held from building a snapshot until its sink returns, so each watcher
    // sees snapshots in the order they were read. Sinks must not call back
    // into the store.
    delivery: Mutex<()>,
    next_watch: AtomicU64,
    fail_writes: AtomicBool,
}

impl SqliteDocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_group INTEGER NOT NULL DEFAULT 0,
                participant_names TEXT NOT NULL DEFAULT '{}',
                last_message TEXT,
                last_activity INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (conversation_id, address)
            );
            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT NOT NULL,
                id TEXT NOT NULL,
                sender_address TEXT NOT NULL,
                sender_name TEXT,
                body TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                quoted TEXT,
                PRIMARY KEY (conversation_id, id)
            );
            CREATE INDEX IF NOT EXISTS participants_by_address ON participants(address);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            watchers: Mutex::new(HashMap::new()),
            delivery: Mutex::new(()),
            next_watch: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are disabled".to_string()));
        }
        Ok(())
    }

    fn query_conversations(conn: &Connection, identity: &str) -> Result<Vec<ConversationDoc>, StoreError> {
        let key = normalize_address(identity);
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.is_group, c.participant_names, c.last_message, c.last_activity
             FROM conversations c
             JOIN participants p ON p.conversation_id = c.id
             WHERE p.address = ?1
             ORDER BY c.last_activity DESC, c.rowid ASC",
        )?;
        let rows = stmt.query_map([key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut docs = Vec::new();
        for row in rows {
            let (id, name, is_group, names_json, last_message, last_activity) = row?;
            let participant_names: BTreeMap<String, String> = serde_json::from_str(&names_json)?;
            let participants = Self::query_participants(conn, &id)?;
            docs.push(ConversationDoc {
                id,
                name,
                participants,
                participant_names,
                last_message,
                last_activity,
                is_group,
            });
        }
        Ok(docs)
    }

    fn query_participants(conn: &Connection, chat_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT address FROM participants WHERE conversation_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([chat_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_messages(conn: &Connection, chat_id: &str) -> Result<Vec<MessageDoc>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, sender_address, sender_name, body, kind, created_at, quoted
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([chat_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut docs = Vec::new();
        for row in rows {
            let (id, sender_address, sender_name, body, kind, created_at, quoted) = row?;
            let kind = match kind.as_str() {
                "image" => MessageKind::Image,
                _ => MessageKind::Text,
            };
            let quoted = match quoted {
                Some(json) => Some(serde_json::from_str::<QuotedMessage>(&json)?),
                None => None,
            };
            docs.push(MessageDoc {
                id,
                sender_address,
                sender_name,
                body,
                kind,
                created_at,
                quoted,
            });
        }
        Ok(docs)
    }

    /// Push fresh snapshots to the conversation-list watchers (if
    /// `conversations`) and to the watchers of one message collection.
    fn notify(&self, conversations: bool, messages_of: Option<&str>) {
        let _delivery = self.delivery.lock();
        let pending: Vec<(SnapshotSink, StoreSnapshot)> = {
            let watchers = self.watchers.lock();
            let conn = self.conn.lock();
            let mut out = Vec::new();
            for (watch, watcher) in watchers.iter() {
                let built = match watcher {
                    Watcher::Conversations { identity, sink } => {
                        if !conversations {
                            continue;
                        }
                        Self::query_conversations(&conn, identity).map(|docs| {
                            (sink.clone(), StoreSnapshot::Conversations { watch: *watch, docs })
                        })
                    }
                    Watcher::Messages { chat_id, sink } => {
                        if messages_of != Some(chat_id.as_str()) {
                            continue;
                        }
                        Self::query_messages(&conn, chat_id).map(|docs| {
                            (
                                sink.clone(),
                                StoreSnapshot::Messages {
                                    watch: *watch,
                                    chat_id: chat_id.clone(),
                                    docs,
                                },
                            )
                        })
                    }
                };
                match built {
                    Ok(item) => out.push(item),
                    Err(e) => tracing::warn!(%e, watch, "store: snapshot query failed"),
                }
            }
            out
        };
        for (sink, snapshot) in pending {
            sink(snapshot);
        }
    }

    fn register(&self, watcher: Watcher) -> WatchId {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(id, watcher);
        id
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn upsert_conversation(&self, doc: &ConversationDoc) -> Result<(), StoreError> {
        self.check_writable()?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let existing_names: Option<String> = tx
                .query_row(
                    "SELECT participant_names FROM conversations WHERE id = ?1",
                    [&doc.id],
                    |row| row.get(0),
                )
                .optional()?;
            let mut names: BTreeMap<String, String> = match existing_names {
                Some(json) => serde_json::from_str(&json)?,
                None => BTreeMap::new(),
            };
            // Each participant owns its own entry; existing names win.
            for (k, v) in &doc.participant_names {
                names.entry(k.clone()).or_insert_with(|| v.clone());
            }
            let names_json = serde_json::to_string(&names)?;
            tx.execute(
                "INSERT INTO conversations (id, name, is_group, participant_names, last_message, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    participant_names = excluded.participant_names,
                    last_message = CASE WHEN excluded.last_activity >= last_activity
                                        THEN COALESCE(excluded.last_message, last_message)
                                        ELSE last_message END,
                    last_activity = MAX(last_activity, excluded.last_activity)",
                params![
                    doc.id,
                    doc.name,
                    doc.is_group,
                    names_json,
                    doc.last_message,
                    doc.last_activity,
                ],
            )?;
            for p in &doc.participants {
                let key = normalize_address(p);
                if key.is_empty() {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO participants (conversation_id, address) VALUES (?1, ?2)",
                    params![doc.id, key],
                )?;
            }
            tx.commit()?;
        }
        self.notify(true, None);
        Ok(())
    }

    fn write_message(&self, chat_id: &str, doc: &MessageDoc) -> Result<bool, StoreError> {
        self.check_writable()?;
        let inserted = {
            let conn = self.conn.lock();
            let quoted = doc.quoted.as_ref().map(serde_json::to_string).transpose()?;
            let kind = match doc.kind {
                MessageKind::Text => "text",
                MessageKind::Image => "image",
            };
            conn.execute(
                "INSERT OR IGNORE INTO messages
                    (conversation_id, id, sender_address, sender_name, body, kind, created_at, quoted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chat_id,
                    doc.id,
                    doc.sender_address,
                    doc.sender_name,
                    doc.body,
                    kind,
                    doc.created_at,
                    quoted,
                ],
            )? == 1
        };
        if inserted {
            self.notify(false, Some(chat_id));
        }
        Ok(inserted)
    }

    fn update_preview(&self, chat_id: &str, preview: &str, at: i64) -> Result<(), StoreError> {
        self.check_writable()?;
        let changed = self.conn.lock().execute(
            "UPDATE conversations SET last_message = ?2, last_activity = ?3
             WHERE id = ?1 AND last_activity <= ?3",
            params![chat_id, preview, at],
        )?;
        if changed > 0 {
            self.notify(true, None);
        }
        Ok(())
    }

    fn delete_conversation(&self, chat_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [chat_id])?;
            tx.execute("DELETE FROM participants WHERE conversation_id = ?1", [chat_id])?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [chat_id])?;
            tx.commit()?;
        }
        self.notify(true, Some(chat_id));
        Ok(())
    }

    fn merge_conversation(&self, from: &str, into: &str) -> Result<(), StoreError> {
        if from == into {
            return Ok(());
        }
        self.check_writable()?;
        let moved = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let moved = tx.execute(
                "INSERT OR IGNORE INTO messages
                    (conversation_id, id, sender_address, sender_name, body, kind, created_at, quoted)
                 SELECT ?2, id, sender_address, sender_name, body, kind, created_at, quoted
                 FROM messages WHERE conversation_id = ?1",
                params![from, into],
            )?;
            tx.execute(
                "UPDATE conversations
                 SET last_message = (SELECT last_message FROM conversations WHERE id = ?1),
                     last_activity = (SELECT last_activity FROM conversations WHERE id = ?1)
                 WHERE id = ?2
                   AND last_activity < (SELECT last_activity FROM conversations WHERE id = ?1)",
                params![from, into],
            )?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [from])?;
            tx.execute("DELETE FROM participants WHERE conversation_id = ?1", [from])?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [from])?;
            tx.commit()?;
            moved
        };
        tracing::info!(from, into, moved, "store: conversations merged");
        self.notify(true, Some(into));
        Ok(())
    }

    fn find_direct_conversation(&self, identity: &str, counterparty: &str) -> Result<Option<ConversationDoc>, StoreError> {
        let key = normalize_address(counterparty);
        let docs = Self::query_conversations(&self.conn.lock(), identity)?;
        Ok(docs
            .into_iter()
            .filter(|d| d.direct_key(identity).as_deref() == Some(key.as_str()))
            .min_by(|a, b| a.id.cmp(&b.id)))
    }

    fn watch_conversations(&self, identity: &str, sink: SnapshotSink) -> Result<WatchId, StoreError> {
        let _delivery = self.delivery.lock();
        let docs = Self::query_conversations(&self.conn.lock(), identity)?;
        let watch = self.register(Watcher::Conversations {
            identity: identity.to_string(),
            sink: sink.clone(),
        });
        sink(StoreSnapshot::Conversations { watch, docs });
        Ok(watch)
    }

    fn watch_messages(&self, chat_id: &str, sink: SnapshotSink) -> Result<WatchId, StoreError> {
        let _delivery = self.delivery.lock();
        let docs = Self::query_messages(&self.conn.lock(), chat_id)?;
        let watch = self.register(Watcher::Messages {
            chat_id: chat_id.to_string(),
            sink: sink.clone(),
        });
        sink(StoreSnapshot::Messages {
            watch,
            chat_id: chat_id.to_string(),
            docs,
        });
        Ok(watch)
    }

    fn unwatch(&self, watch: WatchId) {
        self.watchers.lock().remove(&watch);
    }
}
