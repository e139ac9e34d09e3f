// Projection of session state into `AppState`: the filtered chat list and the
// open conversation with display labels.

use crate::state::{
    now_millis, ChatMessage, ChatSummary, ChatViewState, Conversation, DateSeparator,
};
use crate::timeline::LabelClock;

use super::session::Session;
use super::AppCore;

impl AppCore {
    pub(super) fn refresh_projection(&mut self) {
        self.state.auth = self.logged_in_auth();
        let Some(sess) = self.session.as_ref() else {
            self.state.chat_list.clear();
            self.state.archived_count = 0;
            self.state.locked_count = 0;
            self.state.current_chat = None;
            self.state.typing_peers.clear();
            return;
        };

        self.state.chat_list = sess
            .registry
            .filtered(self.state.chat_list_view, &self.state.search_query)
            .into_iter()
            .map(|chat| summarize(sess, chat))
            .collect();
        self.state.archived_count = sess.registry.archived_count();
        self.state.locked_count = sess.registry.locked_count();
        self.state.typing_peers = sess.typing.typing_peers();
        self.state.current_chat = sess
            .active_chat
            .as_deref()
            .and_then(|id| sess.registry.get(id))
            .map(|chat| chat_view(&self.clock, sess, chat, now_millis()));
    }
}

fn counterparty_typing(sess: &Session, chat: &Conversation) -> bool {
    !chat.is_group && sess.typing.is_typing(&chat.counterparty_address)
}

fn summarize(sess: &Session, chat: &Conversation) -> ChatSummary {
    ChatSummary {
        chat_id: chat.id.clone(),
        display_name: chat.display_name.clone(),
        counterparty_address: chat.counterparty_address.clone(),
        is_group: chat.is_group,
        last_message: chat.last_message_preview.clone(),
        last_message_at: chat.last_activity,
        unread_count: chat.unread_count,
        pinned: chat.pinned,
        muted: chat.muted,
        archived: chat.archived,
        locked: chat.locked,
        blocked: chat.blocked,
        is_typing: counterparty_typing(sess, chat),
    }
}

fn chat_view(clock: &LabelClock, sess: &Session, chat: &Conversation, now: i64) -> ChatViewState {
    let log = sess.log.messages(&chat.id);
    let mut date_separators = Vec::new();
    let mut prev: Option<i64> = None;
    let messages = log
        .iter()
        .map(|m| {
            let new_day = match prev {
                None => true,
                Some(p) => clock.crosses_day(p, m.created_at),
            };
            if new_day {
                date_separators.push(DateSeparator {
                    before_message_id: m.id.clone(),
                    label: clock.date_label(m.created_at, now),
                });
            }
            prev = Some(m.created_at);
            ChatMessage {
                id: m.id.clone(),
                sender_address: m.sender_address.clone(),
                sender_name: m.sender_name.clone(),
                body: m.body.clone(),
                kind: m.kind,
                is_mine: sess.me.is_me(&m.sender_address),
                status: m.status,
                is_pending: m.is_pending(),
                timestamp: m.created_at,
                time_label: clock.time_label(m.created_at),
                scheduled_for: m.scheduled_for,
                quoted: m.quoted.clone(),
                reaction: m.reaction.clone(),
            }
        })
        .collect();

    ChatViewState {
        chat_id: chat.id.clone(),
        display_name: chat.display_name.clone(),
        counterparty_address: chat.counterparty_address.clone(),
        is_group: chat.is_group,
        participants: chat.participants.clone(),
        blocked: chat.blocked,
        wallpaper: chat.wallpaper.clone(),
        messages,
        date_separators,
        counterparty_typing: counterparty_typing(sess, chat),
    }
}
