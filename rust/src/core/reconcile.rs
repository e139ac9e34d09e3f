// Reconciliation: local sends, relay deliveries and store snapshots all land in
// the registry and message log through here. Holds no state of its own.

use std::collections::HashSet;

use crate::error::SyncError;
use crate::identity::{addresses_match, implicit_chat_id, normalize_address};
use crate::relay::RelayMessage;
use crate::state::{Message, MessageDirection, MessageKind, MessageStatus, QuotedMessage};
use crate::store::{ConversationDoc, MessageDoc};

use super::message_log::{InsertOutcome, MessageLog};
use super::registry::{ConversationRegistry, SnapshotMerge, UpsertOutcome};

/// The logged-in party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub address: String,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
        }
    }

    pub fn key(&self) -> String {
        normalize_address(&self.address)
    }

    pub fn is_me(&self, address: &str) -> bool {
        addresses_match(&self.address, address)
    }
}

/// A message the user is about to send.
#[derive(Debug, Clone)]
pub struct Draft {
    pub chat_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub quoted_message_id: Option<String>,
    pub scheduled_for: Option<i64>,
}

impl Draft {
    pub fn text(chat_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            body: body.into(),
            kind: MessageKind::Text,
            quoted_message_id: None,
            scheduled_for: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDisposition {
    /// Our own emission reflected back by the broadcast.
    EchoSuppressed,
    /// Addressed to someone else.
    NotForUs,
    /// No usable sender address.
    Malformed,
    Inserted { chat_id: String, created: bool },
    Duplicate { chat_id: String },
}

pub struct Reconciler<'a> {
    me: &'a LocalIdentity,
    registry: &'a mut ConversationRegistry,
    log: &'a mut MessageLog,
}

impl<'a> Reconciler<'a> {
    pub fn new(me: &'a LocalIdentity, registry: &'a mut ConversationRegistry, log: &'a mut MessageLog) -> Self {
        Self { me, registry, log }
    }

    /// Optimistic send: the message is in the log before anything leaves the
    /// process. Scheduled messages are stored as pending and kept local.
    pub fn accept_local_send(&mut self, draft: Draft, now: i64) -> Result<Message, SyncError> {
        let body = match draft.kind {
            MessageKind::Text => draft.body.trim().to_string(),
            MessageKind::Image => draft.body,
        };
        if body.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let chat = self
            .registry
            .get(&draft.chat_id)
            .ok_or_else(|| SyncError::ConversationNotFound(draft.chat_id.clone()))?;
        if chat.blocked {
            return Err(SyncError::ConversationBlocked(draft.chat_id));
        }
        if let Some(at) = draft.scheduled_for {
            if at <= now {
                return Err(SyncError::ScheduleInPast {
                    scheduled_for: at,
                    now,
                });
            }
        }
        let quoted = match draft.quoted_message_id.as_deref() {
            Some(id) => Some(self.quote(&draft.chat_id, id)?),
            None => None,
        };
        let receiver_address = if chat.is_group {
            None
        } else {
            Some(chat.counterparty_address.clone())
        };

        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: draft.chat_id.clone(),
            sender_address: self.me.address.clone(),
            sender_name: Some(self.me.display_name.clone()),
            receiver_address,
            body,
            kind: draft.kind,
            direction: MessageDirection::Sent,
            status: if draft.scheduled_for.is_some() {
                MessageStatus::Pending
            } else {
                MessageStatus::Sent
            },
            created_at: now,
            scheduled_for: draft.scheduled_for,
            quoted,
            reaction: None,
        };

        self.log.insert(&draft.chat_id, msg.clone());
        self.log.track_local(&msg.id, now, !msg.is_pending());
        if !msg.is_pending() {
            self.registry.touch(&draft.chat_id, &msg.preview(), now)?;
        }
        Ok(msg)
    }

    fn quote(&self, chat_id: &str, message_id: &str) -> Result<QuotedMessage, SyncError> {
        let quoted = self
            .log
            .get(chat_id, message_id)
            .ok_or_else(|| SyncError::MessageNotFound {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        let sender_name = if self.me.is_me(&quoted.sender_address) {
            self.me.display_name.clone()
        } else {
            quoted
                .sender_name
                .clone()
                .unwrap_or_else(|| quoted.sender_address.clone())
        };
        Ok(QuotedMessage {
            sender_name,
            text: quoted.preview(),
        })
    }

    /// One optimistic send per target; failures do not stop the rest.
    pub fn send_to_many(&mut self, chat_ids: &[String], body: &str, now: i64) -> Vec<Result<Message, SyncError>> {
        chat_ids
            .iter()
            .map(|chat_id| self.accept_local_send(Draft::text(chat_id.clone(), body), now))
            .collect()
    }

    /// Filter, route and insert a message delivered by the relay.
    pub fn accept_relay_message(&mut self, payload: &RelayMessage, active_chat: Option<&str>, now: i64) -> RelayDisposition {
        if normalize_address(&payload.sender_id).is_empty() {
            return RelayDisposition::Malformed;
        }
        if self.me.is_me(&payload.sender_id) {
            return RelayDisposition::EchoSuppressed;
        }
        if let Some(receiver) = payload.receiver_id.as_deref().filter(|r| !r.trim().is_empty()) {
            if !self.me.is_me(receiver) {
                return RelayDisposition::NotForUs;
            }
        }

        let group = self.group_route(payload);
        let target = group
            .clone()
            .or_else(|| self.registry.find_by_counterparty(&payload.sender_id).map(|c| c.id.clone()))
            .unwrap_or_else(|| implicit_chat_id(&normalize_address(&payload.sender_id)));
        if self.log.contains(&target, &payload.id) {
            return RelayDisposition::Duplicate { chat_id: target };
        }

        let msg = Message {
            id: payload.id.clone(),
            conversation_id: String::new(),
            sender_address: payload.sender_id.clone(),
            sender_name: payload.sender_name.clone(),
            receiver_address: payload.receiver_id.clone(),
            body: payload.text.clone(),
            kind: payload.data_type,
            direction: MessageDirection::Received,
            status: payload.received_status(),
            created_at: if payload.created_at > 0 { payload.created_at } else { now },
            scheduled_for: None,
            quoted: payload.quoted(),
            reaction: None,
        };
        let preview = msg.preview();

        let (chat_id, outcome) = match group {
            Some(chat_id) => {
                if let Err(e) = self.registry.record_inbound(&chat_id, &preview, now, active_chat) {
                    tracing::warn!(%e, "relay: group vanished during routing");
                }
                (chat_id, UpsertOutcome::Existing)
            }
            None => self.registry.upsert_from_inbound(
                &payload.sender_id,
                payload.sender_name.as_deref(),
                &preview,
                now,
                active_chat,
            ),
        };

        let msg = Message {
            conversation_id: chat_id.clone(),
            ..msg
        };
        let message_id = msg.id.clone();
        match self.log.insert(&chat_id, msg) {
            InsertOutcome::Inserted => {
                // The sender's store write may land after our next snapshot.
                self.log.track_local(&message_id, now, true);
                RelayDisposition::Inserted {
                    chat_id,
                    created: outcome == UpsertOutcome::Created,
                }
            }
            InsertOutcome::DuplicateIgnored => RelayDisposition::Duplicate { chat_id },
        }
    }

    /// A payload naming a known group that lists the sender goes to that group.
    fn group_route(&self, payload: &RelayMessage) -> Option<String> {
        let chat_id = payload.chat_id.as_deref()?;
        let chat = self.registry.get(chat_id)?;
        let member = chat.participants.iter().any(|p| addresses_match(p, &payload.sender_id));
        (chat.is_group && member).then(|| chat.id.clone())
    }

    /// Full replacement of one conversation's log from a store snapshot.
    ///
    /// Locally sent messages the snapshot does not contain yet survive while
    /// they are younger than `grace_ms`; messages the store will never see
    /// (scheduled, failed writes) always survive. Returns how many were kept.
    pub fn apply_message_snapshot(&mut self, chat_id: &str, docs: Vec<MessageDoc>, now: i64, grace_ms: i64) -> usize {
        let keep: HashSet<String> = self
            .log
            .messages(chat_id)
            .iter()
            .filter(|m| match self.log.local_entry(&m.id) {
                Some(entry) => !entry.durable || now - entry.accepted_at <= grace_ms,
                None => false,
            })
            .map(|m| m.id.clone())
            .collect();
        let messages: Vec<Message> = docs
            .into_iter()
            .map(|doc| doc.into_message(chat_id, &self.me.address))
            .collect();
        let retained = self
            .log
            .replace_from_snapshot(chat_id, messages, |m| keep.contains(&m.id));
        if retained > 0 {
            tracing::debug!(chat_id, retained, "snapshot: kept local messages not yet in store");
        }
        retained
    }

    /// Merge the conversation list snapshot, moving log partitions of any
    /// re-keyed conversations.
    pub fn apply_conversation_snapshot(&mut self, docs: &[ConversationDoc]) -> SnapshotMerge {
        let merge = self.registry.apply_store_snapshot(&self.me.address, docs);
        for (old, new) in &merge.rekeyed {
            tracing::info!(old = %old, new = %new, "conversation re-keyed to store id");
            self.log.rename_conversation(old, new);
        }
        merge
    }

    /// Hard delete of a conversation and its log.
    pub fn remove_conversation(&mut self, chat_id: &str) -> Result<usize, SyncError> {
        self.registry
            .remove(chat_id)
            .ok_or_else(|| SyncError::ConversationNotFound(chat_id.to_string()))?;
        Ok(self.log.remove_conversation(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Conversation;

    const ME: &str = "9123456780";
    const ASHA: &str = "9876543210";

    fn me() -> LocalIdentity {
        LocalIdentity::new(ME, "Me")
    }

    fn payload(id: &str, sender: &str, receiver: Option<&str>) -> RelayMessage {
        RelayMessage {
            id: id.to_string(),
            chat_id: Some("their-chat".to_string()),
            text: format!("hello {id}"),
            sender_id: sender.to_string(),
            sender_name: Some("Asha".to_string()),
            receiver_id: receiver.map(str::to_string),
            data_type: MessageKind::Text,
            created_at: 1_000,
            quoted_msg: None,
        }
    }

    fn with_asha() -> ConversationRegistry {
        ConversationRegistry::from_conversations(vec![Conversation::direct(
            "c-asha".into(),
            "Asha".into(),
            ASHA.into(),
            0,
        )])
    }

    #[test]
    fn echo_is_never_inserted() {
        let me = me();
        let mut reg = ConversationRegistry::new();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        let d = rec.accept_relay_message(&payload("m1", "+91 91234-56780", Some(ASHA)), None, 5);
        assert_eq!(d, RelayDisposition::EchoSuppressed);
        assert!(reg.is_empty());
        assert!(log.logs().values().all(Vec::is_empty));
    }

    #[test]
    fn messages_for_someone_else_are_dropped() {
        let me = me();
        let mut reg = ConversationRegistry::new();
        let mut log = MessageLog::new();
        let d = Reconciler::new(&me, &mut reg, &mut log).accept_relay_message(
            &payload("m1", ASHA, Some("9000000000")),
            None,
            5,
        );
        assert_eq!(d, RelayDisposition::NotForUs);
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_sender_is_routed_deterministically() {
        let me = me();
        let mut reg = ConversationRegistry::new();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);

        let second = rec.accept_relay_message(&payload("m2", "+91 98765 43210", None), None, 5);
        let first = rec.accept_relay_message(&payload("m1", ASHA, Some(ME)), None, 6);
        assert_eq!(
            second,
            RelayDisposition::Inserted {
                chat_id: "chat_9876543210".into(),
                created: true
            }
        );
        assert_eq!(
            first,
            RelayDisposition::Inserted {
                chat_id: "chat_9876543210".into(),
                created: false
            }
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("chat_9876543210").unwrap().unread_count, 2);
    }

    #[test]
    fn duplicate_delivery_is_ignored_and_not_counted() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        rec.accept_relay_message(&payload("m1", ASHA, None), None, 5);
        let again = rec.accept_relay_message(&payload("m1", ASHA, None), None, 6);
        assert_eq!(again, RelayDisposition::Duplicate { chat_id: "c-asha".into() });
        assert_eq!(log.messages("c-asha").len(), 1);
        assert_eq!(reg.get("c-asha").unwrap().unread_count, 1);
    }

    #[test]
    fn local_send_then_relay_then_snapshot_yields_one_entry() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);

        let sent = rec.accept_local_send(Draft::text("c-asha", "  hi  "), 100).unwrap();
        assert_eq!(sent.body, "hi");
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.receiver_address.as_deref(), Some(ASHA));

        // Our own copy reflected by the relay.
        let echo = RelayMessage::from_message(&sent);
        assert_eq!(rec.accept_relay_message(&echo, None, 101), RelayDisposition::EchoSuppressed);

        let doc = MessageDoc::from_message(&sent);
        let kept = rec.apply_message_snapshot("c-asha", vec![doc.clone(), doc], 102, 30_000);
        assert_eq!(kept, 0);
        assert_eq!(log.messages("c-asha").len(), 1);
        assert_eq!(log.messages("c-asha")[0].direction, MessageDirection::Sent);
        assert!(log.local_entry(&sent.id).is_none());
        assert_eq!(reg.get("c-asha").unwrap().last_message_preview.as_deref(), Some("hi"));
    }

    #[test]
    fn snapshot_keeps_recent_unpersisted_sends_only_within_grace() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        let sent = rec.accept_local_send(Draft::text("c-asha", "in flight"), 1_000).unwrap();

        assert_eq!(rec.apply_message_snapshot("c-asha", vec![], 2_000, 30_000), 1);
        assert!(log.contains("c-asha", &sent.id));

        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        assert_eq!(rec.apply_message_snapshot("c-asha", vec![], 40_000, 30_000), 0);
        assert!(!log.contains("c-asha", &sent.id));
    }

    #[test]
    fn relayed_message_outlives_a_snapshot_that_predates_it() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        rec.accept_relay_message(&payload("m1", ASHA, Some(ME)), None, 1_000);

        assert_eq!(rec.apply_message_snapshot("c-asha", vec![], 1_500, 30_000), 1);
        assert!(log.contains("c-asha", "m1"));

        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        assert_eq!(rec.apply_message_snapshot("c-asha", vec![], 60_000, 30_000), 0);
        assert!(!log.contains("c-asha", "m1"));
    }

    #[test]
    fn failed_and_scheduled_sends_survive_snapshots() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        let failed = rec.accept_local_send(Draft::text("c-asha", "lost"), 1_000).unwrap();
        let mut draft = Draft::text("c-asha", "later");
        draft.scheduled_for = Some(10_000);
        let scheduled = rec.accept_local_send(draft, 1_000).unwrap();
        assert_eq!(scheduled.status, MessageStatus::Pending);

        log.mark_local_only(&failed.id);
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        assert_eq!(rec.apply_message_snapshot("c-asha", vec![], 500_000, 30_000), 2);
    }

    #[test]
    fn schedule_in_past_is_rejected_without_mutation() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        let mut draft = Draft::text("c-asha", "too late");
        draft.scheduled_for = Some(100);
        assert_eq!(
            rec.accept_local_send(draft, 100),
            Err(SyncError::ScheduleInPast {
                scheduled_for: 100,
                now: 100
            })
        );
        assert!(log.messages("c-asha").is_empty());
        assert_eq!(log.outbox_len(), 0);
    }

    #[test]
    fn blocked_conversations_refuse_sends() {
        let me = me();
        let mut reg = with_asha();
        reg.set_flag("c-asha", crate::state::ChatFlag::Blocked, true).unwrap();
        let mut log = MessageLog::new();
        let res = Reconciler::new(&me, &mut reg, &mut log).accept_local_send(Draft::text("c-asha", "hi"), 1);
        assert_eq!(res, Err(SyncError::ConversationBlocked("c-asha".into())));
        assert!(log.messages("c-asha").is_empty());
    }

    #[test]
    fn scheduled_sends_do_not_touch_the_preview() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut draft = Draft::text("c-asha", "later");
        draft.scheduled_for = Some(5_000);
        Reconciler::new(&me, &mut reg, &mut log)
            .accept_local_send(draft, 1_000)
            .unwrap();
        assert_eq!(reg.get("c-asha").unwrap().last_message_preview, None);
    }

    #[test]
    fn replies_quote_the_original() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        rec.accept_relay_message(&payload("m1", ASHA, Some(ME)), None, 5);

        let mut draft = Draft::text("c-asha", "sure");
        draft.quoted_message_id = Some("m1".into());
        let reply = rec.accept_local_send(draft, 10).unwrap();
        assert_eq!(
            reply.quoted,
            Some(QuotedMessage {
                sender_name: "Asha".into(),
                text: "hello m1".into()
            })
        );

        let mut draft = Draft::text("c-asha", "what?");
        draft.quoted_message_id = Some("missing".into());
        assert!(matches!(
            rec.accept_local_send(draft, 11),
            Err(SyncError::MessageNotFound { .. })
        ));
    }

    #[test]
    fn group_payloads_land_in_the_group() {
        let me = me();
        let mut group = Conversation::direct("g1".into(), "Team".into(), String::new(), 0);
        group.is_group = true;
        group.participants = vec![ASHA.into(), "9000000001".into()];
        let mut reg = ConversationRegistry::from_conversations(vec![
            Conversation::direct("c-asha".into(), "Asha".into(), ASHA.into(), 0),
            group,
        ]);
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);

        let mut p = payload("m1", ASHA, None);
        p.chat_id = Some("g1".into());
        assert_eq!(
            rec.accept_relay_message(&p, None, 5),
            RelayDisposition::Inserted {
                chat_id: "g1".into(),
                created: false
            }
        );

        // Not a member: falls back to the direct chat.
        let mut p = payload("m2", "9000000002", None);
        p.chat_id = Some("g1".into());
        let d = rec.accept_relay_message(&p, None, 6);
        assert_eq!(
            d,
            RelayDisposition::Inserted {
                chat_id: "chat_9000000002".into(),
                created: true
            }
        );
    }

    #[test]
    fn send_to_many_reports_each_target() {
        let me = me();
        let mut reg = with_asha();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        let results = rec.send_to_many(&["c-asha".to_string(), "gone".to_string()], "news", 1);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(SyncError::ConversationNotFound("gone".into())));
    }

    #[test]
    fn rekeyed_conversation_keeps_its_messages() {
        let me = me();
        let mut reg = ConversationRegistry::new();
        let mut log = MessageLog::new();
        let mut rec = Reconciler::new(&me, &mut reg, &mut log);
        rec.accept_relay_message(&payload("m1", ASHA, None), None, 5);

        let doc = ConversationDoc {
            id: "doc-1".into(),
            name: "Asha".into(),
            participants: vec![ASHA.into(), ME.into()],
            participant_names: Default::default(),
            last_message: Some("hello m1".into()),
            last_activity: 5,
            is_group: false,
        };
        let merge = rec.apply_conversation_snapshot(&[doc]);
        assert_eq!(merge.rekeyed.len(), 1);
        assert_eq!(log.messages("doc-1").len(), 1);
        assert!(log.messages("chat_9876543210").is_empty());
        assert!(reg.contains("doc-1"));
    }
}
