// Conversation registry: owns conversation metadata and chat list order.

use std::collections::HashMap;

use crate::error::SyncError;
use crate::identity::{addresses_match, implicit_chat_id, is_implicit_chat_id, normalize_address};
use crate::state::{ChatFlag, ChatListView, Conversation};
use crate::store::ConversationDoc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Existing,
    Created,
}

/// Result of merging a durable-store conversation snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotMerge {
    /// (local id, store id) pairs; the caller moves log partitions.
    pub rekeyed: Vec<(String, String)>,
    pub created: Vec<String>,
    /// (duplicate doc id, canonical doc id) for direct conversations stored
    /// more than once; the caller folds the duplicate in the store.
    pub superseded: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct ConversationRegistry {
    // Insertion order; `order()` sorts a view of it stably.
    chats: Vec<Conversation>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conversations(chats: Vec<Conversation>) -> Self {
        let mut reg = Self::new();
        for chat in chats {
            reg.create(chat);
        }
        reg
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn get(&self, chat_id: &str) -> Option<&Conversation> {
        self.chats.iter().find(|c| c.id == chat_id)
    }

    fn get_mut(&mut self, chat_id: &str) -> Result<&mut Conversation, SyncError> {
        self.chats
            .iter_mut()
            .find(|c| c.id == chat_id)
            .ok_or_else(|| SyncError::ConversationNotFound(chat_id.to_string()))
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.get(chat_id).is_some()
    }

    pub fn all(&self) -> &[Conversation] {
        &self.chats
    }

    /// Insert a conversation; a no-op returning false if the id is taken.
    pub fn create(&mut self, chat: Conversation) -> bool {
        if self.contains(&chat.id) {
            return false;
        }
        self.chats.push(chat);
        true
    }

    /// Direct chats whose counterparty matches win; otherwise the first group
    /// that lists the address as a participant.
    pub fn find_by_counterparty(&self, address: &str) -> Option<&Conversation> {
        self.chats
            .iter()
            .find(|c| !c.is_group && addresses_match(&c.counterparty_address, address))
            .or_else(|| {
                self.chats.iter().find(|c| {
                    c.is_group && c.participants.iter().any(|p| addresses_match(p, address))
                })
            })
    }

    /// Resolve the conversation for an inbound message and record its arrival.
    ///
    /// An unknown sender gets the conversation `chat_<normalized>`, so repeated
    /// first-contact events converge on one id whatever order they arrive in.
    pub fn upsert_from_inbound(
        &mut self,
        sender_address: &str,
        sender_name: Option<&str>,
        preview: &str,
        now: i64,
        active_chat: Option<&str>,
    ) -> (String, UpsertOutcome) {
        let (chat_id, outcome) = match self.find_by_counterparty(sender_address) {
            Some(chat) => (chat.id.clone(), UpsertOutcome::Existing),
            None => {
                let id = implicit_chat_id(&normalize_address(sender_address));
                let name = sender_name
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .unwrap_or(sender_address)
                    .to_string();
                let mut chat = Conversation::direct(id.clone(), name, sender_address.to_string(), now);
                chat.unread_count = 0;
                self.create(chat);
                (id, UpsertOutcome::Created)
            }
        };

        if let Err(e) = self.record_inbound(&chat_id, preview, now, active_chat) {
            tracing::warn!(%e, "upsert_from_inbound: conversation vanished");
        }
        (chat_id, outcome)
    }

    /// Preview, activity and unread bookkeeping for a received message. The
    /// conversation being viewed stays at zero unread.
    pub fn record_inbound(
        &mut self,
        chat_id: &str,
        preview: &str,
        now: i64,
        active_chat: Option<&str>,
    ) -> Result<(), SyncError> {
        let is_active = active_chat == Some(chat_id);
        let chat = self.get_mut(chat_id)?;
        chat.last_message_preview = Some(preview.to_string());
        chat.last_activity = now;
        chat.unread_count = if is_active {
            0
        } else {
            chat.unread_count.saturating_add(1)
        };
        Ok(())
    }

    /// Record a locally originated message. Unread is left alone.
    pub fn touch(&mut self, chat_id: &str, preview: &str, now: i64) -> Result<(), SyncError> {
        let chat = self.get_mut(chat_id)?;
        chat.last_message_preview = Some(preview.to_string());
        chat.last_activity = now;
        Ok(())
    }

    /// Locking is expected to be authorized by the caller.
    pub fn set_flag(&mut self, chat_id: &str, flag: ChatFlag, value: bool) -> Result<(), SyncError> {
        self.get_mut(chat_id)?.set_flag(flag, value);
        Ok(())
    }

    pub fn mark_read(&mut self, chat_id: &str) -> Result<(), SyncError> {
        self.get_mut(chat_id)?.unread_count = 0;
        Ok(())
    }

    /// Mark-as-unread flips between 0 and 1 regardless of the real count.
    pub fn toggle_unread(&mut self, chat_id: &str) -> Result<u32, SyncError> {
        let chat = self.get_mut(chat_id)?;
        chat.unread_count = if chat.unread_count > 0 { 0 } else { 1 };
        Ok(chat.unread_count)
    }

    pub fn set_wallpaper(&mut self, chat_id: &str, wallpaper: Option<String>) -> Result<(), SyncError> {
        self.get_mut(chat_id)?.wallpaper = wallpaper.filter(|w| !w.trim().is_empty());
        Ok(())
    }

    pub fn reset_locks(&mut self) -> usize {
        let mut cleared = 0;
        for chat in self.chats.iter_mut().filter(|c| c.locked) {
            chat.locked = false;
            cleared += 1;
        }
        cleared
    }

    /// Hard delete. The caller cascades to the message log.
    pub fn remove(&mut self, chat_id: &str) -> Option<Conversation> {
        let idx = self.chats.iter().position(|c| c.id == chat_id)?;
        Some(self.chats.remove(idx))
    }

    /// Pinned first, then most recent activity. Ties keep insertion order.
    pub fn order(&self) -> Vec<&Conversation> {
        let mut out: Vec<&Conversation> = self.chats.iter().collect();
        out.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.last_activity.cmp(&a.last_activity))
        });
        out
    }

    /// Ordered chat list for one view, narrowed by a case-insensitive name match.
    pub fn filtered(&self, view: ChatListView, query: &str) -> Vec<&Conversation> {
        let needle = query.trim().to_lowercase();
        self.order()
            .into_iter()
            .filter(|c| match view {
                ChatListView::Main => !c.archived && !c.locked,
                ChatListView::Archived => c.archived,
                ChatListView::Locked => c.locked,
            })
            .filter(|c| needle.is_empty() || c.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn archived_count(&self) -> u32 {
        self.chats.iter().filter(|c| c.archived).count() as u32
    }

    pub fn locked_count(&self) -> u32 {
        self.chats.iter().filter(|c| c.locked).count() as u32
    }

    /// Merge a conversation snapshot from the durable store.
    ///
    /// Store-owned fields come from the snapshot; local flags, unread counts and
    /// wallpapers stay. Conversations missing from the snapshot are kept.
    ///
    /// When several direct docs share a counterparty the lowest id is
    /// canonical, so both sides of a chat converge on the same one.
    pub fn apply_store_snapshot(&mut self, local_identity: &str, docs: &[ConversationDoc]) -> SnapshotMerge {
        let mut merge = SnapshotMerge::default();
        let mut canonical: HashMap<String, &str> = HashMap::new();
        for doc in docs {
            if let Some(key) = doc.direct_key(local_identity) {
                let id = canonical.entry(key).or_insert(doc.id.as_str());
                if doc.id.as_str() < *id {
                    *id = doc.id.as_str();
                }
            }
        }

        for doc in docs {
            if let Some(canon) = doc.direct_key(local_identity).and_then(|k| canonical.get(&k).copied()) {
                if canon != doc.id {
                    merge.superseded.push((doc.id.clone(), canon.to_string()));
                    continue;
                }
            }
            if let Ok(chat) = self.get_mut(&doc.id) {
                doc.apply_to(chat, local_identity);
                continue;
            }

            let incoming = doc.to_conversation(local_identity);
            if !incoming.is_group {
                let existing = self
                    .chats
                    .iter()
                    .position(|c| !c.is_group && addresses_match(&c.counterparty_address, &incoming.counterparty_address));
                if let Some(idx) = existing {
                    let chat = &mut self.chats[idx];
                    if !is_implicit_chat_id(&chat.id) {
                        tracing::info!(chat_id = %chat.id, doc_id = %doc.id, "snapshot: direct chat moves to canonical doc");
                    }
                    let old = std::mem::replace(&mut chat.id, doc.id.clone());
                    doc.apply_to(chat, local_identity);
                    merge.rekeyed.push((old, doc.id.clone()));
                    continue;
                }
            }

            merge.created.push(incoming.id.clone());
            self.chats.push(incoming);
        }
        merge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str, pinned: bool, activity: i64) -> Conversation {
        let mut c = Conversation::direct(id.into(), id.into(), format!("98765432{:02}", id.len()), activity);
        c.pinned = pinned;
        c
    }

    fn ids(list: Vec<&Conversation>) -> Vec<&str> {
        list.into_iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn pinned_first_then_recent() {
        let reg = ConversationRegistry::from_conversations(vec![
            chat("A", false, 300),
            chat("B", true, 100),
            chat("C", false, 500),
        ]);
        assert_eq!(ids(reg.order()), vec!["B", "C", "A"]);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let reg = ConversationRegistry::from_conversations(vec![
            chat("x", false, 10),
            chat("y", false, 10),
            chat("z", false, 10),
        ]);
        assert_eq!(ids(reg.order()), vec!["x", "y", "z"]);
    }

    #[test]
    fn unknown_sender_converges_on_one_conversation() {
        let mut reg = ConversationRegistry::new();
        let (a, first) = reg.upsert_from_inbound("+91 98765-43210", Some("Asha"), "hi", 1, None);
        let (b, second) = reg.upsert_from_inbound("9876543210", None, "again", 2, None);
        assert_eq!(a, "chat_9876543210");
        assert_eq!(a, b);
        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Existing);
        assert_eq!(reg.len(), 1);

        let c = reg.get(&a).unwrap();
        assert_eq!(c.display_name, "Asha");
        assert_eq!(c.unread_count, 2);
        assert_eq!(c.last_message_preview.as_deref(), Some("again"));
        assert!(!c.pinned && !c.muted && !c.archived && !c.locked);
    }

    #[test]
    fn active_conversation_stays_read() {
        let mut reg = ConversationRegistry::new();
        let (id, _) = reg.upsert_from_inbound("9876543210", None, "one", 1, None);
        assert_eq!(reg.get(&id).unwrap().unread_count, 1);
        reg.upsert_from_inbound("9876543210", None, "two", 2, Some(&id));
        assert_eq!(reg.get(&id).unwrap().unread_count, 0);
    }

    #[test]
    fn groups_match_by_participant_after_direct_chats() {
        let mut group = Conversation::direct("g1".into(), "Team".into(), String::new(), 1);
        group.is_group = true;
        group.participants = vec!["9876543210".into(), "9123456780".into()];
        let mut reg = ConversationRegistry::from_conversations(vec![group]);

        assert_eq!(reg.find_by_counterparty("9123456780").map(|c| c.id.as_str()), Some("g1"));

        reg.create(Conversation::direct("d1".into(), "Ravi".into(), "+91 91234 56780".into(), 2));
        assert_eq!(reg.find_by_counterparty("9123456780").map(|c| c.id.as_str()), Some("d1"));
    }

    #[test]
    fn views_and_search() {
        let mut reg = ConversationRegistry::from_conversations(vec![
            Conversation::direct("1".into(), "Asha".into(), "9000000001".into(), 1),
            Conversation::direct("2".into(), "Ravi".into(), "9000000002".into(), 2),
            Conversation::direct("3".into(), "Sasha".into(), "9000000003".into(), 3),
        ]);
        reg.set_flag("2", ChatFlag::Archived, true).unwrap();
        reg.set_flag("3", ChatFlag::Locked, true).unwrap();

        assert_eq!(ids(reg.filtered(ChatListView::Main, "")), vec!["1"]);
        assert_eq!(ids(reg.filtered(ChatListView::Archived, "")), vec!["2"]);
        assert_eq!(ids(reg.filtered(ChatListView::Locked, "SHA")), vec!["3"]);
        assert_eq!(reg.archived_count(), 1);
        assert_eq!(reg.locked_count(), 1);

        assert_eq!(reg.reset_locks(), 1);
        assert_eq!(ids(reg.filtered(ChatListView::Main, "sha")), vec!["3", "1"]);
    }

    #[test]
    fn toggle_unread_flips_between_zero_and_one() {
        let mut reg = ConversationRegistry::new();
        let (id, _) = reg.upsert_from_inbound("9876543210", None, "a", 1, None);
        reg.upsert_from_inbound("9876543210", None, "b", 2, None);
        assert_eq!(reg.toggle_unread(&id).unwrap(), 0);
        assert_eq!(reg.toggle_unread(&id).unwrap(), 1);
        reg.mark_read(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().unread_count, 0);
    }

    #[test]
    fn unknown_conversation_is_an_error() {
        let mut reg = ConversationRegistry::new();
        assert_eq!(
            reg.set_flag("nope", ChatFlag::Pinned, true),
            Err(SyncError::ConversationNotFound("nope".into()))
        );
        assert!(reg.remove("nope").is_none());
    }

    #[test]
    fn snapshot_rekeys_implicit_chat_and_keeps_local_flags() {
        let mut reg = ConversationRegistry::new();
        let (implicit, _) = reg.upsert_from_inbound("9876543210", Some("Asha"), "hi", 5, None);
        reg.set_flag(&implicit, ChatFlag::Pinned, true).unwrap();
        reg.create(Conversation::direct("keep".into(), "Local only".into(), "9000000009".into(), 1));

        let doc = ConversationDoc {
            id: "doc-1".into(),
            name: "Asha".into(),
            participants: vec!["9123456780".into(), "9876543210".into()],
            participant_names: [("9876543210".to_string(), "Asha K".to_string())].into_iter().collect(),
            last_message: Some("hi".into()),
            last_activity: 7,
            is_group: false,
        };
        let merge = reg.apply_store_snapshot("9123456780", &[doc.clone()]);
        assert_eq!(merge.rekeyed, vec![(implicit.clone(), "doc-1".to_string())]);
        assert!(merge.created.is_empty());

        let chat = reg.get("doc-1").unwrap();
        assert!(chat.pinned);
        assert_eq!(chat.display_name, "Asha K");
        assert_eq!(chat.unread_count, 1);
        assert!(reg.get(&implicit).is_none());
        assert!(reg.contains("keep"));

        // A second snapshot is a plain field merge.
        let merge = reg.apply_store_snapshot("9123456780", &[doc]);
        assert_eq!(merge, SnapshotMerge::default());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_direct_docs_converge_on_lowest_id() {
        let doc = |id: &str| ConversationDoc {
            id: id.into(),
            name: "Asha".into(),
            participants: vec!["9123456780".into(), "9876543210".into()],
            participant_names: Default::default(),
            last_message: None,
            last_activity: 1,
            is_group: false,
        };

        // Each side created its own doc before seeing the other's.
        let mut mine = ConversationRegistry::from_conversations(vec![Conversation::direct(
            "b-doc".into(),
            "Asha".into(),
            "9876543210".into(),
            1,
        )]);
        mine.set_flag("b-doc", ChatFlag::Muted, true).unwrap();
        let merge = mine.apply_store_snapshot("9123456780", &[doc("b-doc"), doc("a-doc")]);
        assert_eq!(merge.rekeyed, vec![("b-doc".to_string(), "a-doc".to_string())]);
        assert_eq!(merge.superseded, vec![("b-doc".to_string(), "a-doc".to_string())]);
        assert_eq!(mine.len(), 1);
        assert!(mine.get("a-doc").unwrap().muted);

        let mut theirs = ConversationRegistry::from_conversations(vec![Conversation::direct(
            "a-doc".into(),
            "Me".into(),
            "9123456780".into(),
            1,
        )]);
        let merge = theirs.apply_store_snapshot("9876543210", &[doc("a-doc"), doc("b-doc")]);
        assert!(merge.rekeyed.is_empty());
        assert_eq!(merge.superseded, vec![("b-doc".to_string(), "a-doc".to_string())]);
        assert_eq!(theirs.len(), 1);
    }
}
