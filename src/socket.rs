use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::chat::{self, SendMessageRequest};
use crate::contacts::resolve_contacts;
use crate::events::{ClientEvent, ServerEvent};
use crate::privacy::can_see_presence;
use crate::store::{PresenceChange, Store};

struct Connection {
    username: String,
    tx: mpsc::UnboundedSender<WsMessage>,
}

type Connections = Arc<RwLock<HashMap<String, Connection>>>;

/// Live socket connections keyed by socket id.
#[derive(Clone)]
pub struct SocketHub {
    store: Store,
    connections: Connections,
}

impl SocketHub {
    pub fn new(store: Store) -> Self {
        SocketHub {
            store,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket, username: String) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket_id = self.attach(&username, tx).await;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) => {
                        if msg.is_close() {
                            break;
                        }
                        let Ok(text) = msg.to_str() else {
                            continue;
                        };
                        match serde_json::from_str::<ClientEvent>(text) {
                            Ok(event) => hub.handle_client_event(&username, event).await,
                            Err(e) => {
                                debug!("Bad event from {}: {}", username, e);
                                hub.send_to_socket(
                                    &socket_id,
                                    &ServerEvent::Error {
                                        message: format!("Invalid event: {e}"),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                    Err(e) => {
                        error!("WebSocket error for {}: {}", username, e);
                        break;
                    }
                }
            }

            hub.detach(&socket_id).await;
        });
    }

    /// Registers a connection and marks its user online.
    pub async fn attach(&self, username: &str, tx: mpsc::UnboundedSender<WsMessage>) -> String {
        let socket_id = Uuid::new_v4().to_string();
        {
            let mut connections = self.connections.write().await;
            connections.insert(
                socket_id.clone(),
                Connection {
                    username: username.to_string(),
                    tx,
                },
            );
        }

        let online = PresenceChange::Online {
            socket_id: socket_id.clone(),
        };
        if let Err(e) = self.store.set_presence(username, online).await {
            error!("Failed to mark {} online: {}", username, e);
        }
        info!("{} connected on socket {}", username, socket_id);
        self.broadcast_presence(username).await;
        socket_id
    }

    /// Drops a connection. The user only goes offline if this was their
    /// current socket.
    pub async fn detach(&self, socket_id: &str) {
        let removed = self.connections.write().await.remove(socket_id);
        let Some(connection) = removed else {
            return;
        };

        let username = connection.username;
        let offline = PresenceChange::Offline {
            socket_id: socket_id.to_string(),
            at: Utc::now(),
        };
        match self.store.set_presence(&username, offline).await {
            Ok(true) => self.broadcast_presence(&username).await,
            Ok(false) => {}
            Err(e) => error!("Failed to mark {} offline: {}", username, e),
        }
        info!("{} disconnected from socket {}", username, socket_id);
    }

    async fn handle_client_event(&self, username: &str, event: ClientEvent) {
        match event {
            ClientEvent::SendMessage { to, text, file_url } => {
                let req = SendMessageRequest { to, text, file_url };
                match chat::send_message(self.store.as_ref(), username, req).await {
                    Ok(message) => {
                        self.notify_user(
                            &message.to_username,
                            &ServerEvent::NewMessage {
                                message: message.clone(),
                            },
                        )
                        .await;
                        self.notify_user(username, &ServerEvent::MessageSent { message })
                            .await;
                    }
                    Err(e) => {
                        self.notify_user(username, &ServerEvent::Error { message: e.to_string() })
                            .await;
                    }
                }
            }

            ClientEvent::Typing { to } => {
                self.notify_user(
                    &to,
                    &ServerEvent::Typing {
                        from: username.to_string(),
                    },
                )
                .await;
            }

            ClientEvent::MarkRead { from } => {
                match chat::mark_read(self.store.as_ref(), username, &from).await {
                    Ok((count, notify)) => {
                        if count > 0 && notify {
                            self.notify_user(
                                &from,
                                &ServerEvent::MessagesRead {
                                    by: username.to_string(),
                                },
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        self.notify_user(username, &ServerEvent::Error { message: e.to_string() })
                            .await;
                    }
                }
            }
        }
    }

    /// Sends to whichever socket the user is currently attached on.
    pub async fn notify_user(&self, username: &str, event: &ServerEvent) {
        let socket_id = match self.store.find_user(username).await {
            Some(user) => user.socket_id,
            None => None,
        };
        if let Some(socket_id) = socket_id {
            self.send_to_socket(&socket_id, event).await;
        }
    }

    async fn send_to_socket(&self, socket_id: &str, event: &ServerEvent) {
        if let Ok(msg) = serde_json::to_string(event) {
            let connections = self.connections.read().await;
            if let Some(connection) = connections.get(socket_id) {
                let _ = connection.tx.send(WsMessage::text(msg));
            }
        }
    }

    /// Tells every other connection about `username`'s presence, masked per
    /// recipient by the user's last-seen setting.
    async fn broadcast_presence(&self, username: &str) {
        let Some(user) = self.store.find_user(username).await else {
            return;
        };
        let contacts = resolve_contacts(self.store.as_ref(), username).await;

        let connections = self.connections.read().await;
        for connection in connections.values() {
            if connection.username == username {
                continue;
            }
            let visible = can_see_presence(&connection.username, &user, &contacts);
            let event = ServerEvent::UserStatus {
                username: user.username.clone(),
                is_online: visible && user.is_online,
                last_seen: user.last_seen.filter(|_| visible),
            };
            if let Ok(msg) = serde_json::to_string(&event) {
                let _ = connection.tx.send(WsMessage::text(msg));
            }
        }
    }
}
