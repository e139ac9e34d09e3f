use serde::{Deserialize, Serialize};

#[derive(uniffi::Record, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub display_name: String,
    /// Raw address of the other party (empty for groups).
    pub counterparty_address: String,
    pub last_message_preview: Option<String>,
    /// Unix millis of the last activity; drives chat list order.
    pub last_activity: i64,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
    pub locked: bool,
    pub blocked: bool,
    pub unread_count: u32,
    pub participants: Vec<String>,
    pub is_group: bool,
    pub wallpaper: Option<String>,
}

impl Conversation {
    pub fn direct(id: String, display_name: String, counterparty: String, now: i64) -> Self {
        Self {
            id,
            display_name,
            participants: vec![counterparty.clone()],
            counterparty_address: counterparty,
            last_message_preview: None,
            last_activity: now,
            pinned: false,
            muted: false,
            archived: false,
            locked: false,
            blocked: false,
            unread_count: 0,
            is_group: false,
            wallpaper: None,
        }
    }

    pub fn flag(&self, flag: ChatFlag) -> bool {
        match flag {
            ChatFlag::Pinned => self.pinned,
            ChatFlag::Muted => self.muted,
            ChatFlag::Archived => self.archived,
            ChatFlag::Locked => self.locked,
            ChatFlag::Blocked => self.blocked,
        }
    }

    pub fn set_flag(&mut self, flag: ChatFlag, value: bool) {
        match flag {
            ChatFlag::Pinned => self.pinned = value,
            ChatFlag::Muted => self.muted = value,
            ChatFlag::Archived => self.archived = value,
            ChatFlag::Locked => self.locked = value,
            ChatFlag::Blocked => self.blocked = value,
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChatFlag {
    Pinned,
    Muted,
    Archived,
    Locked,
    Blocked,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Sent,
    Received,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    /// Scheduled and not yet revealed. Only ever moves to `Sent`.
    Pending,
}

#[derive(uniffi::Record, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotedMessage {
    pub sender_name: String,
    pub text: String,
}

#[derive(uniffi::Record, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub receiver_address: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    /// Unix millis; the log is ordered by this value.
    pub created_at: i64,
    pub scheduled_for: Option<i64>,
    pub quoted: Option<QuotedMessage>,
    pub reaction: Option<String>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Text shown in the chat list for this message.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => self.body.clone(),
            MessageKind::Image => "📷 Photo".to_string(),
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChatListView {
    /// Everything except archived and locked chats.
    #[default]
    Main,
    Archived,
    Locked,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub chat_list: Vec<ChatSummary>,
    pub chat_list_view: ChatListView,
    pub search_query: String,
    pub archived_count: u32,
    pub locked_count: u32,
    pub current_chat: Option<ChatViewState>,
    /// Normalized addresses of counterparties currently shown as typing.
    pub typing_peers: Vec<String>,
    pub toast: Option<String>,
    pub activation_notice: Option<ActivationNotice>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            chat_list: vec![],
            chat_list_view: ChatListView::Main,
            search_query: String::new(),
            archived_count: 0,
            locked_count: 0,
            current_chat: None,
            typing_peers: vec![],
            toast: None,
            activation_notice: None,
        }
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn {
        address: String,
        display_name: String,
    },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ChatSummary {
    pub chat_id: String,
    pub display_name: String,
    pub counterparty_address: String,
    pub is_group: bool,
    pub last_message: Option<String>,
    pub last_message_at: i64,
    pub unread_count: u32,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
    pub locked: bool,
    pub blocked: bool,
    pub is_typing: bool,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct ChatViewState {
    pub chat_id: String,
    pub display_name: String,
    pub counterparty_address: String,
    pub is_group: bool,
    pub participants: Vec<String>,
    pub blocked: bool,
    pub wallpaper: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub date_separators: Vec<DateSeparator>,
    pub counterparty_typing: bool,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub is_mine: bool,
    pub status: MessageStatus,
    pub is_pending: bool,
    pub timestamp: i64,
    pub time_label: String,
    pub scheduled_for: Option<i64>,
    pub quoted: Option<QuotedMessage>,
    pub reaction: Option<String>,
}

/// A date heading rendered above `before_message_id`.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct DateSeparator {
    pub before_message_id: String,
    pub label: String,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ActivationNotice {
    pub chat_id: String,
    pub message_id: String,
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_setters() {
        let mut chat = Conversation::direct("c1".into(), "Asha".into(), "9876543210".into(), 10);
        for flag in [
            ChatFlag::Pinned,
            ChatFlag::Muted,
            ChatFlag::Archived,
            ChatFlag::Locked,
            ChatFlag::Blocked,
        ] {
            assert!(!chat.flag(flag));
            chat.set_flag(flag, true);
            assert!(chat.flag(flag));
        }
    }

    #[test]
    fn image_messages_preview_as_photo() {
        let msg = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_address: "9876543210".into(),
            sender_name: None,
            receiver_address: None,
            body: "data:image/png;base64,AAAA".into(),
            kind: MessageKind::Image,
            direction: MessageDirection::Received,
            status: MessageStatus::Delivered,
            created_at: 1,
            scheduled_for: None,
            quoted: None,
            reaction: None,
        };
        assert_eq!(msg.preview(), "📷 Photo");
    }
}
