use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::DomainResult;
use crate::identity::UserRef;
use crate::messages::Message;
use crate::ports::directory::UserDirectory;
use crate::ports::messages::MessageRepository;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub content: String,
    pub created_at_ms: i64,
    pub sender_id: String,
}

impl LastMessage {
    fn from_message(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            created_at_ms: message.created_at_ms,
            sender_id: message.sender_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub other_user: UserRef,
    pub last_message: LastMessage,
}

type CounterpartEntries = HashMap<String, LastMessage>;

/// Per-user cache answering "list my conversations, most recent first, with
/// a last-message preview". Maintained incrementally on every append and
/// reproducible from a full store scan; the cache holds nothing that cannot
/// be rebuilt.
pub struct ConversationIndex {
    entries: RwLock<HashMap<String, Arc<RwLock<CounterpartEntries>>>>,
    messages: Arc<dyn MessageRepository>,
    directory: Arc<dyn UserDirectory>,
}

impl ConversationIndex {
    pub fn new(messages: Arc<dyn MessageRepository>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            messages,
            directory,
        }
    }

    /// Applies a freshly appended message to both participants' caches.
    /// Guarded per user; an older message never overwrites a newer preview.
    pub async fn upsert(&self, message: &Message) {
        for user_id in [&message.sender_id, &message.receiver_id] {
            let known = {
                let entries = self.entries.read().await;
                entries.contains_key(user_id.as_str())
            };
            if !known {
                // First sighting of this user in the process: seed from the
                // store so the fresh preview cannot mask older conversations.
                if let Err(err) = self.rebuild(user_id).await {
                    tracing::warn!(user_id = %user_id, error = %err, "conversation cache seed failed");
                }
            }

            let counterpart = message.counterpart_of(user_id).to_string();
            let user_entries = self.user_entries(user_id).await;
            let mut user_entries = user_entries.write().await;
            match user_entries.get(&counterpart) {
                Some(existing) if existing.created_at_ms > message.created_at_ms => {}
                _ => {
                    user_entries.insert(counterpart, LastMessage::from_message(message));
                }
            }
        }
    }

    /// Summaries for the viewer, sorted by last activity descending. A user
    /// not yet cached (cold start, crash recovery) is rebuilt from the store
    /// first.
    pub async fn list(&self, user_id: &str) -> DomainResult<Vec<ConversationSummary>> {
        let cached = {
            let entries = self.entries.read().await;
            entries.get(user_id).cloned()
        };
        let user_entries = match cached {
            Some(user_entries) => user_entries,
            None => {
                self.rebuild(user_id).await?;
                self.user_entries(user_id).await
            }
        };

        let mut previews: Vec<(String, LastMessage)> = {
            let user_entries = user_entries.read().await;
            user_entries
                .iter()
                .map(|(counterpart, last)| (counterpart.clone(), last.clone()))
                .collect()
        };
        previews.sort_by(|a, b| {
            b.1.created_at_ms
                .cmp(&a.1.created_at_ms)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut summaries = Vec::with_capacity(previews.len());
        for (counterpart, last_message) in previews {
            let other_user = self
                .directory
                .resolve(&counterpart)
                .await?
                .unwrap_or_else(|| UserRef::bare(counterpart));
            summaries.push(ConversationSummary {
                other_user,
                last_message,
            });
        }
        Ok(summaries)
    }

    /// Recomputes one user's cache from the message store: group every
    /// message touching the user by counterpart, keep the max-timestamp one.
    /// Produces exactly what the incremental upserts would have.
    pub async fn rebuild(&self, user_id: &str) -> DomainResult<()> {
        let messages = self.messages.list_by_participant(user_id).await?;
        let mut rebuilt: CounterpartEntries = HashMap::new();
        for message in &messages {
            let counterpart = message.counterpart_of(user_id).to_string();
            match rebuilt.get(&counterpart) {
                Some(existing) if existing.created_at_ms > message.created_at_ms => {}
                _ => {
                    rebuilt.insert(counterpart, LastMessage::from_message(message));
                }
            }
        }

        let user_entries = self.user_entries(user_id).await;
        let mut user_entries = user_entries.write().await;
        *user_entries = rebuilt;
        Ok(())
    }

    async fn user_entries(&self, user_id: &str) -> Arc<RwLock<CounterpartEntries>> {
        {
            let entries = self.entries.read().await;
            if let Some(user_entries) = entries.get(user_id) {
                return user_entries.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }
}
