use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Message, User};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("username '{0}' is already taken")]
    DuplicateUser(String),
    #[error("user '{0}' not found")]
    UserNotFound(String),
    #[error("message '{0}' not found")]
    MessageNotFound(String),
}

/// In-place edit applied to a stored user under the store's write lock.
pub type UserUpdate = Box<dyn FnOnce(&mut User) + Send>;

pub type MessageUpdate = Box<dyn FnOnce(&mut Message) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online { socket_id: String },
    /// Only applies while `socket_id` is still the user's current socket.
    Offline {
        socket_id: String,
        at: DateTime<Utc>,
    },
}

/// Storage seam for users and messages.
///
/// User writes never replace a whole record. Presence is last-write-wins
/// over `isOnline`/`socketId`/`lastSeen` only, so it cannot clobber a
/// concurrent profile or privacy edit.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    /// Applies `update` to the stored user and returns the result.
    async fn update_user(&self, username: &str, update: UserUpdate) -> Result<User, StoreError>;
    /// Returns whether the change was applied.
    async fn set_presence(&self, username: &str, change: PresenceChange) -> Result<bool, StoreError>;
    async fn find_user(&self, username: &str) -> Option<User>;
    async fn list_users(&self) -> Vec<User>;

    async fn insert_message(&self, message: Message) -> Result<(), StoreError>;
    async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message, StoreError>;
    async fn find_message(&self, id: &str) -> Option<Message>;
    /// Every message between `a` and `b`, oldest first.
    async fn conversation(&self, a: &str, b: &str) -> Vec<Message>;
    /// Every message `username` sent or received, oldest first.
    async fn messages_involving(&self, username: &str) -> Vec<Message>;
    /// Distinct `toUsername` values over messages sent by `from`.
    async fn distinct_recipients(&self, from: &str) -> BTreeSet<String>;
    /// Distinct `fromUsername` values over messages sent to `to`.
    async fn distinct_senders(&self, to: &str) -> BTreeSet<String>;
}

pub type Store = Arc<dyn ChatStore>;

type Users = Arc<RwLock<HashMap<String, User>>>;
type Messages = Arc<RwLock<Vec<Message>>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Users,
    messages: Messages,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Store {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.username) {
            return Err(StoreError::DuplicateUser(user.username));
        }
        users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn update_user(&self, username: &str, update: UserUpdate) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        update(user);
        Ok(user.clone())
    }

    async fn set_presence(&self, username: &str, change: PresenceChange) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        match change {
            PresenceChange::Online { socket_id } => {
                user.is_online = true;
                user.socket_id = Some(socket_id);
                Ok(true)
            }
            PresenceChange::Offline { socket_id, at } => {
                if user.socket_id.as_deref() != Some(socket_id.as_str()) {
                    return Ok(false);
                }
                user.is_online = false;
                user.socket_id = None;
                user.last_seen = Some(at);
                Ok(true)
            }
        }
    }

    async fn find_user(&self, username: &str) -> Option<User> {
        self.users.read().await.get(username).cloned()
    }

    async fn list_users(&self) -> Vec<User> {
        let users = self.users.read().await;
        let mut list: Vec<User> = users.values().cloned().collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }

    async fn insert_message(&self, message: Message) -> Result<(), StoreError> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message, StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))?;
        update(message);
        Ok(message.clone())
    }

    async fn find_message(&self, id: &str) -> Option<Message> {
        let messages = self.messages.read().await;
        messages.iter().find(|m| m.id == id).cloned()
    }

    async fn conversation(&self, a: &str, b: &str) -> Vec<Message> {
        let messages = self.messages.read().await;
        let mut found: Vec<Message> = messages
            .iter()
            .filter(|m| {
                (m.from_username == a && m.to_username == b)
                    || (m.from_username == b && m.to_username == a)
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        found
    }

    async fn messages_involving(&self, username: &str) -> Vec<Message> {
        let messages = self.messages.read().await;
        let mut found: Vec<Message> = messages
            .iter()
            .filter(|m| m.involves(username))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        found
    }

    async fn distinct_recipients(&self, from: &str) -> BTreeSet<String> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .filter(|m| m.from_username == from)
            .map(|m| m.to_username.clone())
            .collect()
    }

    async fn distinct_senders(&self, to: &str) -> BTreeSet<String> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .filter(|m| m.to_username == to)
            .map(|m| m.from_username.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = MemoryStore::new();
        store.insert_user(User::new("alice", String::new())).await.unwrap();
        let err = store
            .insert_user(User::new("alice", String::new()))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateUser("alice".into()));
    }

    #[tokio::test]
    async fn update_unknown_user_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_user("ghost", Box::new(|u| u.about = Some("x".into())))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::UserNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn presence_and_privacy_writes_do_not_clobber_each_other() {
        let store = MemoryStore::new();
        store.insert_user(User::new("alice", String::new())).await.unwrap();

        // a stale read taken before either write lands
        let stale = store.find_user("alice").await.unwrap();
        assert!(!stale.is_online);

        store
            .set_presence("alice", PresenceChange::Online { socket_id: "s1".into() })
            .await
            .unwrap();
        store
            .update_user(
                "alice",
                Box::new(|u| u.privacy_settings.last_seen = crate::models::Visibility::Nobody),
            )
            .await
            .unwrap();

        let alice = store.find_user("alice").await.unwrap();
        assert!(alice.is_online);
        assert_eq!(alice.socket_id.as_deref(), Some("s1"));
        assert_eq!(alice.privacy_settings.last_seen, crate::models::Visibility::Nobody);

        let applied = store
            .set_presence(
                "alice",
                PresenceChange::Offline {
                    socket_id: "s1".into(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(applied);
        let alice = store.find_user("alice").await.unwrap();
        assert!(!alice.is_online);
        assert_eq!(alice.privacy_settings.last_seen, crate::models::Visibility::Nobody);
    }

    #[tokio::test]
    async fn offline_for_stale_socket_is_ignored() {
        let store = MemoryStore::new();
        store.insert_user(User::new("alice", String::new())).await.unwrap();
        store
            .set_presence("alice", PresenceChange::Online { socket_id: "new".into() })
            .await
            .unwrap();
        let applied = store
            .set_presence(
                "alice",
                PresenceChange::Offline {
                    socket_id: "old".into(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.find_user("alice").await.unwrap().is_online);
    }

    #[tokio::test]
    async fn concurrent_message_updates_both_land() {
        let store = MemoryStore::new();
        let msg = Message::new("alice", "bob", Some("hi".into()), None);
        store.insert_message(msg.clone()).await.unwrap();

        let star = store.update_message(
            &msg.id,
            Box::new(|m| {
                m.starred_by.insert("bob".into());
            }),
        );
        let pin = store.update_message(&msg.id, Box::new(|m| m.pinned = true));
        let (starred, pinned) = tokio::join!(star, pin);
        starred.unwrap();
        pinned.unwrap();

        let stored = store.find_message(&msg.id).await.unwrap();
        assert!(stored.pinned);
        assert!(stored.starred_by.contains("bob"));

        let err = store
            .update_message("missing", Box::new(|m| m.pinned = true))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::MessageNotFound("missing".into()));
    }

    #[tokio::test]
    async fn conversation_is_two_sided_and_ordered() {
        let store = MemoryStore::new();
        let first = Message::new("alice", "bob", Some("hi".into()), None);
        let mut second = Message::new("bob", "alice", Some("hey".into()), None);
        second.timestamp = first.timestamp + chrono::Duration::seconds(1);
        store.insert_message(second.clone()).await.unwrap();
        store.insert_message(first.clone()).await.unwrap();
        store
            .insert_message(Message::new("alice", "carol", Some("x".into()), None))
            .await
            .unwrap();

        let convo = store.conversation("bob", "alice").await;
        assert_eq!(convo, vec![first, second]);
    }

    #[tokio::test]
    async fn distinct_queries_deduplicate() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .insert_message(Message::new("alice", "bob", Some("hi".into()), None))
                .await
                .unwrap();
        }
        store
            .insert_message(Message::new("carol", "alice", Some("yo".into()), None))
            .await
            .unwrap();

        assert_eq!(
            store.distinct_recipients("alice").await,
            BTreeSet::from(["bob".to_string()])
        );
        assert_eq!(
            store.distinct_senders("alice").await,
            BTreeSet::from(["carol".to_string()])
        );
    }
}
