use crate::state::{ChatFlag, ChatListView, MessageKind};

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Auth
    Login {
        address: String,
        display_name: String,
    },
    Logout,

    // Conversations
    AddContact {
        name: String,
        address: String,
    },
    CreateGroup {
        name: String,
        member_chat_ids: Vec<String>,
    },
    OpenChat {
        chat_id: String,
    },
    CloseChat,
    SetChatFlag {
        chat_id: String,
        flag: ChatFlag,
        value: bool,
    },
    ToggleUnread {
        chat_id: String,
    },
    DeleteChat {
        chat_id: String,
    },
    SetWallpaper {
        chat_id: String,
        wallpaper: Option<String>,
    },
    ResetLocks,

    // Messages
    SendMessage {
        chat_id: String,
        content: String,
        kind: MessageKind,
        quoted_message_id: Option<String>,
    },
    ScheduleMessage {
        chat_id: String,
        content: String,
        scheduled_for: i64,
    },
    SendToMany {
        chat_ids: Vec<String>,
        content: String,
    },
    ToggleReaction {
        chat_id: String,
        message_id: String,
        emoji: String,
    },
    ComposeChanged {
        chat_id: String,
        text: String,
    },

    // UI
    SetChatListView {
        view: ChatListView,
        query: String,
    },
    ClearToast,
    ClearActivationNotice,
}

impl AppAction {
    /// Log-safe action tag (never includes message bodies or addresses).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",

            // Conversations
            AppAction::AddContact { .. } => "AddContact",
            AppAction::CreateGroup { .. } => "CreateGroup",
            AppAction::OpenChat { .. } => "OpenChat",
            AppAction::CloseChat => "CloseChat",
            AppAction::SetChatFlag { .. } => "SetChatFlag",
            AppAction::ToggleUnread { .. } => "ToggleUnread",
            AppAction::DeleteChat { .. } => "DeleteChat",
            AppAction::SetWallpaper { .. } => "SetWallpaper",
            AppAction::ResetLocks => "ResetLocks",

            // Messages
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::ScheduleMessage { .. } => "ScheduleMessage",
            AppAction::SendToMany { .. } => "SendToMany",
            AppAction::ToggleReaction { .. } => "ToggleReaction",
            AppAction::ComposeChanged { .. } => "ComposeChanged",

            // UI
            AppAction::SetChatListView { .. } => "SetChatListView",
            AppAction::ClearToast => "ClearToast",
            AppAction::ClearActivationNotice => "ClearActivationNotice",
        }
    }
}
