use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Message;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "send_message")]
    SendMessage {
        to: String,
        text: Option<String>,
        #[serde(rename = "fileUrl")]
        file_url: Option<String>,
    },
    #[serde(rename = "typing")]
    Typing { to: String },
    #[serde(rename = "mark_read")]
    MarkRead { from: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage { message: Message },
    #[serde(rename = "message_sent")]
    MessageSent { message: Message },
    #[serde(rename = "typing")]
    Typing { from: String },
    #[serde(rename = "messages_read")]
    MessagesRead { by: String },
    #[serde(rename = "user_status", rename_all = "camelCase")]
    UserStatus {
        username: String,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}
