use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    SpoilerImage,
    SpoilerVideo,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReplyTo {
    pub id: String,
    pub nickname: String,
    pub text: String,
}

/// A chat message as stored in the document and sent on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub nickname: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub media_path: Option<String>,
    pub timestamp: u64,
    #[serde(rename = "replyTo", default)]
    pub reply_to: Option<ReplyTo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserSummary {
    pub nickname: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Join,
    Leave,
    Info,
    Expiry,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        room_id: String,
        nickname: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        lang: Option<String>,
    },
    #[serde(rename = "message", rename_all = "camelCase")]
    Message {
        room: String,
        nickname: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(rename = "type")]
        kind: MessageKind,
        #[serde(default)]
        media_path: Option<String>,
        #[serde(rename = "replyTo", default)]
        reply_to: Option<ReplyTo>,
    },
    #[serde(rename = "deleteMessage")]
    DeleteMessage { id: String },
    #[serde(rename = "clearRoom")]
    ClearRoom,
    #[serde(rename = "clearUserMessages")]
    ClearUserMessages,
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { is_typing: bool },
    #[serde(rename = "setExpiry")]
    SetExpiry { hours: u32 },
    #[serde(rename = "markRead")]
    MarkRead { id: String },
    #[serde(rename = "translateMessage", rename_all = "camelCase")]
    TranslateMessage {
        msg_id: String,
        text: String,
        #[serde(default)]
        source_lang: Option<String>,
        #[serde(default)]
        target_lang: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "history")]
    History { messages: Vec<Message> },
    #[serde(rename = "message")]
    Message { message: Message },
    #[serde(rename = "messageDeleted")]
    MessageDeleted { id: String },
    #[serde(rename = "userMessagesCleared")]
    UserMessagesCleared { nickname: String },
    #[serde(rename = "roomCleared")]
    RoomCleared,
    #[serde(rename = "system", rename_all = "camelCase")]
    System {
        #[serde(rename = "type")]
        kind: SystemKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hours: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        timestamp: u64,
    },
    #[serde(rename = "userList")]
    UserList { users: Vec<UserSummary> },
    #[serde(rename = "userTyping", rename_all = "camelCase")]
    UserTyping { nickname: String, is_typing: bool },
    #[serde(rename = "roomConfig")]
    RoomConfig { expiry: u32 },
    #[serde(rename = "messageRead", rename_all = "camelCase")]
    MessageRead { msg_id: String, reader: String },
    #[serde(rename = "translatedMessage", rename_all = "camelCase")]
    TranslatedMessage {
        msg_id: String,
        translated: String,
        target_lang: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<bool>,
    },
}
