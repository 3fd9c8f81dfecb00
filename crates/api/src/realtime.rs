use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};

use parley_domain::DomainResult;
use parley_domain::conversations::ConversationIndex;
use parley_domain::error::DomainError;
use parley_domain::identity::ActorIdentity;
use parley_domain::messages::{Message, MessageService, PairKey};
use parley_domain::presence::PresenceTracker;

use crate::observability;

/// Events pushed from the gateway to a live connection. Tagged the way the
/// web client expects them on the wire.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "event_type")]
pub enum ServerEvent {
    #[serde(rename = "receive_message")]
    ReceiveMessage { message: Message },
    #[serde(rename = "online_users_update")]
    OnlineUsersUpdate { users: Vec<String> },
    #[serde(rename = "chatError")]
    ChatError { kind: String, message: String },
}

/// Events a connection may send after the upgrade.
#[derive(Debug, Deserialize)]
#[serde(tag = "event_type")]
pub enum ClientEvent {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },
    #[serde(rename = "send_message")]
    SendMessage {
        receiver_id: String,
        content: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

pub fn error_kind(err: &DomainError) -> &'static str {
    match err {
        DomainError::Validation(_) => "validation_error",
        DomainError::NotFound => "not_found",
        DomainError::Storage(_) => "storage_error",
    }
}

/// Fan-out hub between the message store and live connections. Holds the
/// per-user connection registry; presence bookkeeping stays inside the
/// tracker and the gateway only reacts to the edge signals it returns.
///
/// The append-upsert-fanout sequence for one conversation pair runs under a
/// per-pair guard, so a thread's events reach connections in exactly the
/// order the store assigned them. Unrelated pairs do not contend.
pub struct RealtimeGateway {
    connections: RwLock<HashMap<String, HashMap<String, EventSender>>>,
    pair_guards: RwLock<HashMap<PairKey, Arc<Mutex<()>>>>,
    messages: MessageService,
    conversations: Arc<ConversationIndex>,
    presence: Arc<PresenceTracker>,
}

impl RealtimeGateway {
    pub fn new(
        messages: MessageService,
        conversations: Arc<ConversationIndex>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pair_guards: RwLock::new(HashMap::new()),
            messages,
            conversations,
            presence,
        }
    }

    /// Attaches an authenticated connection. On a true offline-to-online
    /// transition the updated online set goes to everyone; otherwise only
    /// the new connection receives a snapshot.
    pub async fn register(&self, user_id: &str, connection_id: &str, sender: EventSender) {
        {
            let mut connections = self.connections.write().await;
            connections
                .entry(user_id.to_string())
                .or_default()
                .insert(connection_id.to_string(), sender.clone());
        }

        if self.presence.connect(user_id, connection_id).await.is_some() {
            observability::register_presence_transition("online");
            self.broadcast_online_users().await;
        } else {
            let users = self.presence.list_online(None).await;
            let _ = sender.send(ServerEvent::OnlineUsersUpdate { users });
        }
    }

    pub async fn deregister(&self, user_id: &str, connection_id: &str) {
        {
            let mut connections = self.connections.write().await;
            if let Some(senders) = connections.get_mut(user_id) {
                senders.remove(connection_id);
                if senders.is_empty() {
                    connections.remove(user_id);
                }
            }
        }

        if self
            .presence
            .disconnect(user_id, connection_id)
            .await
            .is_some()
        {
            observability::register_presence_transition("offline");
            self.broadcast_online_users().await;
        }
    }

    /// The write path: durably append, update the conversation index, then
    /// fan the canonical message out to every live connection of both
    /// participants. A failed append returns before anything is pushed.
    pub async fn send_message(
        &self,
        actor: &ActorIdentity,
        receiver_id: &str,
        content: &str,
    ) -> DomainResult<Message> {
        let guard = self
            .pair_guard(&PairKey::new(&actor.user_id, receiver_id))
            .await;
        let _serialized = guard.lock().await;

        let message = self.messages.append(actor, receiver_id, content).await?;
        self.conversations.upsert(&message).await;
        self.fan_out(&message).await;
        Ok(message)
    }

    async fn fan_out(&self, message: &Message) {
        let connections = self.connections.read().await;
        for user_id in [&message.sender_id, &message.receiver_id] {
            let Some(senders) = connections.get(user_id) else {
                continue;
            };
            for (connection_id, sender) in senders {
                let event = ServerEvent::ReceiveMessage {
                    message: message.clone(),
                };
                if sender.send(event).is_err() {
                    tracing::warn!(
                        user_id = %user_id,
                        connection_id = %connection_id,
                        "fan-out target unreachable; skipping"
                    );
                    observability::register_fanout_event("receive_message", "dropped");
                } else {
                    observability::register_fanout_event("receive_message", "delivered");
                }
            }
        }
    }

    /// Pushes the full online set to every live connection.
    pub async fn broadcast_online_users(&self) {
        let users = self.presence.list_online(None).await;
        let connections = self.connections.read().await;
        for senders in connections.values() {
            for sender in senders.values() {
                let event = ServerEvent::OnlineUsersUpdate {
                    users: users.clone(),
                };
                if sender.send(event).is_err() {
                    observability::register_fanout_event("online_users_update", "dropped");
                } else {
                    observability::register_fanout_event("online_users_update", "delivered");
                }
            }
        }
    }

    async fn pair_guard(&self, key: &PairKey) -> Arc<Mutex<()>> {
        {
            let guards = self.pair_guards.read().await;
            if let Some(guard) = guards.get(key) {
                return guard.clone();
            }
        }
        let mut guards = self.pair_guards.write().await;
        guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
