use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::messages::MessageRepository;

const MAX_CONTENT_LENGTH: usize = 2_000;
const MAX_MESSAGES_PER_PAGE: usize = 200;
const DEFAULT_PAGE_LIMIT: usize = 50;

/// A durably recorded one-to-one message. Created exclusively by the message
/// store on append; `read_by` is the only field that ever changes afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at_ms: i64,
    pub read_by: Vec<String>,
}

impl Message {
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(&self.sender_id, &self.receiver_id)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// The other participant from the given user's point of view.
    pub fn counterpart_of(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Unordered participant pair identifying a conversation. There is exactly
/// one conversation per pair; it has no identity of its own.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            Self {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    pub fn as_storage_key(&self) -> String {
        format!("{}:{}", self.low, self.high)
    }
}

/// Validated append input. Id and timestamp are assigned by the repository.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct ThreadPage {
    pub before_ms: Option<i64>,
    pub limit: usize,
}

pub fn build_thread_page(limit: Option<usize>, before_ms: Option<i64>) -> ThreadPage {
    let safe_limit = limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_MESSAGES_PER_PAGE);
    ThreadPage {
        before_ms,
        limit: safe_limit,
    }
}

#[derive(Clone)]
pub struct MessageService {
    repository: Arc<dyn MessageRepository>,
}

impl MessageService {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self { repository }
    }

    /// Validates and durably appends a message, returning the canonical
    /// record with the store-assigned id and timestamp. Nothing may be
    /// announced to live connections before this returns Ok.
    pub async fn append(
        &self,
        actor: &ActorIdentity,
        receiver_id: &str,
        content: &str,
    ) -> DomainResult<Message> {
        let content = content.trim();
        validate_message_input(&actor.user_id, receiver_id, content)?;
        let input = NewMessage {
            sender_id: actor.user_id.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
        };
        self.repository.append(&input).await
    }

    /// Chronological page of the thread between the viewer and another user.
    pub async fn fetch_thread(
        &self,
        viewer: &ActorIdentity,
        other_user_id: &str,
        page: ThreadPage,
    ) -> DomainResult<Vec<Message>> {
        if other_user_id.trim().is_empty() {
            return Err(DomainError::Validation("other user id is required".into()));
        }
        self.repository
            .list_thread(&viewer.user_id, other_user_id, &page)
            .await
    }

    /// Marks a message read by the actor. Idempotent; re-marking is a no-op
    /// that never touches storage.
    pub async fn mark_read(
        &self,
        actor: &ActorIdentity,
        message_id: &str,
    ) -> DomainResult<Message> {
        let message = self
            .repository
            .get_message(message_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if !message.involves(&actor.user_id) {
            return Err(DomainError::Validation(
                "user is not a participant of this message".into(),
            ));
        }
        if message.read_by.iter().any(|id| id == &actor.user_id) {
            return Ok(message);
        }
        self.repository.mark_read(message_id, &actor.user_id).await
    }
}

fn validate_message_input(sender_id: &str, receiver_id: &str, content: &str) -> DomainResult<()> {
    if receiver_id.trim().is_empty() {
        return Err(DomainError::Validation("receiver id is required".into()));
    }
    if sender_id == receiver_id {
        return Err(DomainError::Validation(
            "cannot send a message to yourself".into(),
        ));
    }
    if content.is_empty() {
        return Err(DomainError::Validation("content is required".into()));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(DomainError::Validation(format!(
            "content exceeds max length of {MAX_CONTENT_LENGTH}"
        )));
    }
    Ok(())
}
