use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::{
    Surreal,
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::{Mutex, RwLock};

use crate::db::DbConfig;
use parley_domain::DomainResult;
use parley_domain::error::DomainError;
use parley_domain::messages::{Message, NewMessage, PairKey, ThreadPage};
use parley_domain::ports::BoxFuture;
use parley_domain::ports::messages::MessageRepository;
use parley_domain::util::{now_ms, uuid_v7_without_dashes};

/// Hands out one append guard per conversation pair. The guard carries the
/// last timestamp assigned to that pair, so appends within a pair are
/// serialized and strictly ordered while unrelated pairs proceed in
/// parallel.
#[derive(Default)]
struct PairSequencer {
    guards: RwLock<HashMap<PairKey, Arc<Mutex<i64>>>>,
}

impl PairSequencer {
    async fn guard(&self, key: &PairKey) -> Arc<Mutex<i64>> {
        {
            let guards = self.guards.read().await;
            if let Some(guard) = guards.get(key) {
                return guard.clone();
            }
        }
        let mut guards = self.guards.write().await;
        guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }
}

fn assign_timestamp(last_ms: &mut i64) -> i64 {
    let now = now_ms();
    let assigned = if now <= *last_ms { *last_ms + 1 } else { now };
    *last_ms = assigned;
    assigned
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    threads: Arc<RwLock<HashMap<PairKey, Vec<Message>>>>,
    by_id: Arc<RwLock<HashMap<String, PairKey>>>,
    sequencer: Arc<PairSequencer>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageRepository for InMemoryMessageRepository {
    fn append(&self, input: &NewMessage) -> BoxFuture<'_, DomainResult<Message>> {
        let input = input.clone();
        let threads = self.threads.clone();
        let by_id = self.by_id.clone();
        let sequencer = self.sequencer.clone();
        Box::pin(async move {
            let key = PairKey::new(&input.sender_id, &input.receiver_id);
            let guard = sequencer.guard(&key).await;
            let mut last_ms = guard.lock().await;
            let message = Message {
                message_id: uuid_v7_without_dashes(),
                sender_id: input.sender_id,
                receiver_id: input.receiver_id,
                content: input.content,
                created_at_ms: assign_timestamp(&mut last_ms),
                read_by: Vec::new(),
            };
            // No suspension point between the two mutations: cancellation
            // cannot leave a half-written record.
            let mut by_id = by_id.write().await;
            let mut threads = threads.write().await;
            by_id.insert(message.message_id.clone(), key.clone());
            threads.entry(key).or_default().push(message.clone());
            Ok(message)
        })
    }

    fn get_message(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let message_id = message_id.to_string();
        let threads = self.threads.clone();
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let by_id = by_id.read().await;
            let Some(key) = by_id.get(&message_id) else {
                return Ok(None);
            };
            let threads = threads.read().await;
            Ok(threads
                .get(key)
                .and_then(|log| log.iter().find(|m| m.message_id == message_id))
                .cloned())
        })
    }

    fn list_thread(
        &self,
        user_a: &str,
        user_b: &str,
        page: &ThreadPage,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let key = PairKey::new(user_a, user_b);
        let page = page.clone();
        let threads = self.threads.clone();
        Box::pin(async move {
            let threads = threads.read().await;
            let Some(log) = threads.get(&key) else {
                return Ok(Vec::new());
            };
            let eligible: Vec<&Message> = log
                .iter()
                .filter(|m| page.before_ms.map_or(true, |before| m.created_at_ms < before))
                .collect();
            let skip = eligible.len().saturating_sub(page.limit);
            Ok(eligible[skip..].iter().map(|m| (*m).clone()).collect())
        })
    }

    fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Message>> {
        let message_id = message_id.to_string();
        let user_id = user_id.to_string();
        let threads = self.threads.clone();
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let by_id = by_id.read().await;
            let key = by_id.get(&message_id).ok_or(DomainError::NotFound)?;
            let mut threads = threads.write().await;
            let message = threads
                .get_mut(key)
                .and_then(|log| log.iter_mut().find(|m| m.message_id == message_id))
                .ok_or(DomainError::NotFound)?;
            if !message.read_by.contains(&user_id) {
                message.read_by.push(user_id);
            }
            Ok(message.clone())
        })
    }

    fn list_by_participant(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let user_id = user_id.to_string();
        let threads = self.threads.clone();
        Box::pin(async move {
            let threads = threads.read().await;
            let mut messages: Vec<Message> = threads
                .iter()
                .filter(|(key, _)| key.contains(&user_id))
                .flat_map(|(_, log)| log.iter().cloned())
                .collect();
            messages.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.message_id.cmp(&b.message_id))
            });
            Ok(messages)
        })
    }
}

pub struct SurrealMessageRepository {
    client: Arc<Surreal<Client>>,
    sequencer: Arc<PairSequencer>,
}

impl SurrealMessageRepository {
    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = Surreal::<Client>::init();
        db.connect::<Ws>(&db_config.endpoint).await?;
        db.signin(Root {
            username: &db_config.username,
            password: &db_config.password,
        })
        .await?;
        db.use_ns(&db_config.namespace)
            .use_db(&db_config.database)
            .await?;
        Ok(Self {
            client: Arc::new(db),
            sequencer: Arc::new(PairSequencer::default()),
        })
    }

    fn to_rfc3339(created_at_ms: i64) -> DomainResult<String> {
        let instant = OffsetDateTime::from_unix_timestamp_nanos(created_at_ms as i128 * 1_000_000)
            .map_err(|err| DomainError::Storage(format!("invalid timestamp: {err}")))?;
        Ok(instant
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()))
    }

    fn parse_datetime(value: &str) -> DomainResult<i64> {
        let datetime = OffsetDateTime::parse(value, &Rfc3339)
            .map_err(|err| DomainError::Storage(format!("invalid datetime: {err}")))?;
        Ok((datetime.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        DomainError::Storage(format!("surreal query failed: {err}"))
    }

    fn decode_message_rows(rows: Vec<Value>) -> DomainResult<Vec<Message>> {
        rows.into_iter()
            .map(|row| {
                serde_json::from_value::<SurrealMessageRow>(row)
                    .map_err(|err| DomainError::Storage(format!("invalid message row: {err}")))
                    .and_then(Self::map_message_row)
            })
            .collect()
    }

    fn map_message_row(row: SurrealMessageRow) -> DomainResult<Message> {
        Ok(Message {
            message_id: row.message_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at_ms: Self::parse_datetime(&row.created_at)?,
            read_by: row.read_by,
        })
    }

    const SELECT_FIELDS: &'static str = "SELECT\n\
            message_id,\n\
            sender_id,\n\
            receiver_id,\n\
            content,\n\
            type::string(created_at) AS created_at,\n\
            read_by\n\
         FROM message";
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealMessageRow {
    message_id: String,
    sender_id: String,
    receiver_id: String,
    content: String,
    created_at: String,
    read_by: Vec<String>,
}

impl MessageRepository for SurrealMessageRepository {
    fn append(&self, input: &NewMessage) -> BoxFuture<'_, DomainResult<Message>> {
        let input = input.clone();
        let client = self.client.clone();
        let sequencer = self.sequencer.clone();
        Box::pin(async move {
            let key = PairKey::new(&input.sender_id, &input.receiver_id);
            let guard = sequencer.guard(&key).await;
            let mut last_ms = guard.lock().await;
            let message = Message {
                message_id: uuid_v7_without_dashes(),
                sender_id: input.sender_id,
                receiver_id: input.receiver_id,
                content: input.content,
                created_at_ms: assign_timestamp(&mut last_ms),
                read_by: Vec::new(),
            };
            let created_at = Self::to_rfc3339(message.created_at_ms)?;

            let response = client
                .query(
                    "CREATE message CONTENT {\n\
                        message_id: $message_id,\n\
                        sender_id: $sender_id,\n\
                        receiver_id: $receiver_id,\n\
                        pair_key: $pair_key,\n\
                        content: $content,\n\
                        created_at: <datetime>$created_at,\n\
                        read_by: []\n\
                    };",
                )
                .bind(("message_id", message.message_id.clone()))
                .bind(("sender_id", message.sender_id.clone()))
                .bind(("receiver_id", message.receiver_id.clone()))
                .bind(("pair_key", key.as_storage_key()))
                .bind(("content", message.content.clone()))
                .bind(("created_at", created_at))
                .await
                .map_err(Self::map_surreal_error)?;
            response.check().map_err(Self::map_surreal_error)?;
            Ok(message)
        })
    }

    fn get_message(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<Message>>> {
        let message_id = message_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let query_sql = format!(
                "{} WHERE message_id = $message_id LIMIT 1",
                Self::SELECT_FIELDS
            );
            let mut response = client
                .query(query_sql)
                .bind(("message_id", message_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            Ok(Self::decode_message_rows(rows)?.into_iter().next())
        })
    }

    fn list_thread(
        &self,
        user_a: &str,
        user_b: &str,
        page: &ThreadPage,
    ) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let key = PairKey::new(user_a, user_b);
        let page = page.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let mut query_sql = format!("{} WHERE pair_key = $pair_key", Self::SELECT_FIELDS);
            let before = page
                .before_ms
                .map(Self::to_rfc3339)
                .transpose()?;
            if before.is_some() {
                query_sql.push_str(" AND created_at < <datetime>$before");
            }
            query_sql.push_str(&format!(
                " ORDER BY created_at DESC, message_id DESC LIMIT {}",
                page.limit
            ));

            let mut query_handle = client.query(query_sql).bind(("pair_key", key.as_storage_key()));
            if let Some(before) = before {
                query_handle = query_handle.bind(("before", before));
            }
            let mut response = query_handle.await.map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            let mut messages = Self::decode_message_rows(rows)?;
            messages.reverse();
            Ok(messages)
        })
    }

    fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Message>> {
        let message_id = message_id.to_string();
        let user_id = user_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .query(
                    "UPDATE message\n\
                     SET read_by = array::union(read_by, [$user_id])\n\
                     WHERE message_id = $message_id;",
                )
                .bind(("message_id", message_id.clone()))
                .bind(("user_id", user_id))
                .await
                .map_err(Self::map_surreal_error)?;
            response.check().map_err(Self::map_surreal_error)?;
            self.get_message(&message_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn list_by_participant(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<Message>>> {
        let user_id = user_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let query_sql = format!(
                "{} WHERE sender_id = $user_id OR receiver_id = $user_id\n\
                 ORDER BY created_at ASC, message_id ASC",
                Self::SELECT_FIELDS
            );
            let mut response = client
                .query(query_sql)
                .bind(("user_id", user_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Storage(format!("invalid query result: {err}")))?;
            Self::decode_message_rows(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::messages::build_thread_page;

    fn new_message(sender: &str, receiver: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn thread_returns_exactly_the_appended_sequence() {
        let repo = InMemoryMessageRepository::new();
        let mut appended = Vec::new();
        for content in ["one", "two", "three"] {
            appended.push(
                repo.append(&new_message("alice", "bob", content))
                    .await
                    .expect("append"),
            );
        }
        // Interleave another pair; it must not leak into alice/bob.
        repo.append(&new_message("alice", "carol", "other thread"))
            .await
            .expect("append");

        let thread = repo
            .list_thread("bob", "alice", &build_thread_page(None, None))
            .await
            .expect("thread");
        assert_eq!(thread, appended);
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing_per_pair() {
        let repo = InMemoryMessageRepository::new();
        let mut previous = 0;
        for i in 0..20 {
            let message = repo
                .append(&new_message("alice", "bob", &format!("m{i}")))
                .await
                .expect("append");
            assert!(message.created_at_ms > previous);
            previous = message.created_at_ms;
        }
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_pair_never_lose_or_reorder() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let mut handles = Vec::new();
        for i in 0..10 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.append(&new_message("alice", "bob", &format!("m{i}")))
                    .await
                    .expect("append")
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let thread = repo
            .list_thread("alice", "bob", &build_thread_page(None, None))
            .await
            .expect("thread");
        assert_eq!(thread.len(), 10);
        for window in thread.windows(2) {
            assert!(window[0].created_at_ms < window[1].created_at_ms);
        }
    }

    #[tokio::test]
    async fn pagination_returns_newest_page_and_older_pages_before_it() {
        let repo = InMemoryMessageRepository::new();
        for i in 0..5 {
            repo.append(&new_message("alice", "bob", &format!("m{i}")))
                .await
                .expect("append");
        }

        let newest = repo
            .list_thread("alice", "bob", &build_thread_page(Some(2), None))
            .await
            .expect("page");
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].content, "m3");
        assert_eq!(newest[1].content, "m4");

        let older = repo
            .list_thread(
                "alice",
                "bob",
                &build_thread_page(Some(2), Some(newest[0].created_at_ms)),
            )
            .await
            .expect("older page");
        assert_eq!(older.len(), 2);
        assert_eq!(older[0].content, "m1");
        assert_eq!(older[1].content, "m2");
    }

    #[tokio::test]
    async fn mark_read_adds_once_and_is_idempotent() {
        let repo = InMemoryMessageRepository::new();
        let message = repo
            .append(&new_message("alice", "bob", "hello"))
            .await
            .expect("append");

        repo.mark_read(&message.message_id, "bob").await.expect("mark");
        let marked = repo
            .mark_read(&message.message_id, "bob")
            .await
            .expect("mark again");
        assert_eq!(marked.read_by, vec!["bob".to_string()]);

        let err = repo.mark_read("missing", "bob").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[tokio::test]
    async fn list_by_participant_spans_pairs_in_timestamp_order() {
        let repo = InMemoryMessageRepository::new();
        repo.append(&new_message("alice", "bob", "to bob"))
            .await
            .expect("append");
        repo.append(&new_message("carol", "alice", "from carol"))
            .await
            .expect("append");
        repo.append(&new_message("bob", "carol", "unrelated"))
            .await
            .expect("append");

        let messages = repo.list_by_participant("alice").await.expect("scan");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].created_at_ms <= messages[1].created_at_ms);
        assert!(messages.iter().all(|m| m.involves("alice")));
    }
}
