use crate::DomainResult;
use crate::messages::{Message, NewMessage, ThreadPage};

/// Append-only log of one-to-one messages; the single source of truth.
pub trait MessageRepository: Send + Sync {
    /// Persists the message, assigning the canonical id and timestamp.
    /// Appends for the same conversation pair are serialized so timestamps
    /// never regress within a thread; unrelated pairs proceed in parallel.
    fn append(&self, input: &NewMessage) -> crate::ports::BoxFuture<'_, DomainResult<Message>>;

    fn get_message(
        &self,
        message_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Message>>>;

    /// Chronologically ascending page of the thread between two users. The
    /// store is pair-agnostic; access control belongs to the caller.
    fn list_thread(
        &self,
        user_a: &str,
        user_b: &str,
        page: &ThreadPage,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Message>>>;

    /// Adds the user to the message's read set. Idempotent.
    fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Message>>;

    /// Every message involving the user, ascending by timestamp then id.
    /// Recovery scan backing the conversation index rebuild.
    fn list_by_participant(
        &self,
        user_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Message>>>;
}
