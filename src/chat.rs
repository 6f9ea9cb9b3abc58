use std::collections::HashMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::contacts::resolve_contacts;
use crate::error::ApiError;
use crate::models::Message;
use crate::privacy::{filter_for_requester, list_entry, UserListEntry};
use crate::store::ChatStore;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub to: String,
    pub text: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentChat {
    pub user: UserListEntry,
    pub last_message: Message,
    pub unread_count: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub async fn send_message(
    store: &dyn ChatStore,
    from: &str,
    req: SendMessageRequest,
) -> Result<Message, ApiError> {
    let text = non_empty(req.text);
    let file_url = non_empty(req.file_url);
    if text.is_none() && file_url.is_none() {
        return Err(ApiError::BadRequest(
            "Message needs text or a file".to_string(),
        ));
    }
    if store.find_user(&req.to).await.is_none() {
        return Err(ApiError::NotFound(format!("User '{}' not found", req.to)));
    }

    let message = Message::new(from, req.to, text, file_url);
    store.insert_message(message.clone()).await?;
    info!("{} -> {}: message {}", message.from_username, message.to_username, message.id);
    Ok(message)
}

/// Hides the read flag from a sender whose recipient turned read receipts off.
fn apply_receipts(viewer: &str, mut message: Message, partner_receipts: bool) -> Message {
    if message.from_username == viewer && !partner_receipts {
        message.read = false;
    }
    message
}

async fn receipts_enabled(store: &dyn ChatStore, username: &str) -> bool {
    store
        .find_user(username)
        .await
        .map_or(true, |u| u.privacy_settings.read_receipts)
}

/// A single message as `viewer` should see it.
pub async fn present(store: &dyn ChatStore, viewer: &str, message: Message) -> Message {
    let partner = message.partner_of(viewer).to_string();
    let receipts = receipts_enabled(store, &partner).await;
    apply_receipts(viewer, message, receipts)
}

pub async fn conversation(
    store: &dyn ChatStore,
    requester: &str,
    partner: &str,
) -> Result<Vec<Message>, ApiError> {
    let partner_user = store
        .find_user(partner)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("User '{partner}' not found")))?;
    let receipts = partner_user.privacy_settings.read_receipts;
    Ok(store
        .conversation(requester, partner)
        .await
        .into_iter()
        .map(|m| apply_receipts(requester, m, receipts))
        .collect())
}

/// Marks everything `partner` sent to `reader` as read.
///
/// Returns how many messages changed and whether the partner may be told.
pub async fn mark_read(
    store: &dyn ChatStore,
    reader: &str,
    partner: &str,
) -> Result<(usize, bool), ApiError> {
    if store.find_user(partner).await.is_none() {
        return Err(ApiError::NotFound(format!("User '{partner}' not found")));
    }
    let mut count = 0;
    for message in store.conversation(reader, partner).await {
        if message.to_username == reader && !message.read {
            store
                .update_message(&message.id, Box::new(|m| m.read = true))
                .await?;
            count += 1;
        }
    }
    Ok((count, receipts_enabled(store, reader).await))
}

async fn participant_message(
    store: &dyn ChatStore,
    username: &str,
    id: &str,
) -> Result<Message, ApiError> {
    let message = store
        .find_message(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Message '{id}' not found")))?;
    if !message.involves(username) {
        return Err(ApiError::Forbidden(
            "Not a participant in this conversation".to_string(),
        ));
    }
    Ok(message)
}

pub async fn toggle_star(store: &dyn ChatStore, username: &str, id: &str) -> Result<Message, ApiError> {
    participant_message(store, username, id).await?;
    let username = username.to_string();
    let message = store
        .update_message(
            id,
            Box::new(move |m| {
                if !m.starred_by.remove(&username) {
                    m.starred_by.insert(username);
                }
            }),
        )
        .await?;
    Ok(message)
}

pub async fn react(
    store: &dyn ChatStore,
    username: &str,
    id: &str,
    emoji: &str,
) -> Result<Message, ApiError> {
    participant_message(store, username, id).await?;
    let (username, emoji) = (username.to_string(), emoji.trim().to_string());
    let message = store
        .update_message(id, Box::new(move |m| m.set_reaction(&username, &emoji)))
        .await?;
    Ok(message)
}

pub async fn edit(
    store: &dyn ChatStore,
    username: &str,
    id: &str,
    text: String,
) -> Result<Message, ApiError> {
    let message = participant_message(store, username, id).await?;
    if message.from_username != username {
        return Err(ApiError::Forbidden(
            "Only the sender can edit a message".to_string(),
        ));
    }
    let text = non_empty(Some(text))
        .ok_or_else(|| ApiError::BadRequest("Edited text cannot be empty".to_string()))?;
    let message = store
        .update_message(id, Box::new(move |m| m.edit_text(text)))
        .await?;
    Ok(message)
}

pub async fn toggle_pin(store: &dyn ChatStore, username: &str, id: &str) -> Result<Message, ApiError> {
    participant_message(store, username, id).await?;
    let message = store
        .update_message(id, Box::new(|m| m.pinned = !m.pinned))
        .await?;
    Ok(message)
}

/// One entry per conversation partner, newest conversation first.
pub async fn recent_chats(store: &dyn ChatStore, requester: &str) -> Vec<RecentChat> {
    let contacts = resolve_contacts(store, requester).await;

    let mut latest: HashMap<String, Message> = HashMap::new();
    let mut unread: HashMap<String, usize> = HashMap::new();
    for message in store.messages_involving(requester).await {
        let partner = message.partner_of(requester).to_string();
        if partner == requester {
            continue;
        }
        if message.to_username == requester && !message.read {
            *unread.entry(partner.clone()).or_default() += 1;
        }
        // messages_involving is oldest first, so the last write wins
        latest.insert(partner, message);
    }

    let mut chats = Vec::with_capacity(latest.len());
    for (partner, message) in latest {
        let Some(user) = store.find_user(&partner).await else {
            continue;
        };
        let receipts = user.privacy_settings.read_receipts;
        chats.push(RecentChat {
            user: list_entry(filter_for_requester(requester, &user, &contacts)),
            last_message: apply_receipts(requester, message, receipts),
            unread_count: unread.get(&partner).copied().unwrap_or(0),
        });
    }
    chats.sort_by(|a, b| b.last_message.timestamp.cmp(&a.last_message.timestamp));
    chats
}
