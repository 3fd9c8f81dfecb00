use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use parley_domain::DomainResult;
use parley_domain::identity::UserRef;
use parley_domain::ports::BoxFuture;
use parley_domain::ports::directory::UserDirectory;

/// Display-snapshot cache fed from token claims. Lives and dies with the
/// process; an unknown id simply falls back to a bare reference.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Arc<RwLock<HashMap<String, UserRef>>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn record(&self, user: &UserRef) -> BoxFuture<'_, DomainResult<()>> {
        let user = user.clone();
        let users = self.users.clone();
        Box::pin(async move {
            let mut users = users.write().await;
            users.insert(user.user_id.clone(), user);
            Ok(())
        })
    }

    fn resolve(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Option<UserRef>>> {
        let user_id = user_id.to_string();
        let users = self.users.clone();
        Box::pin(async move {
            let users = users.read().await;
            Ok(users.get(&user_id).cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_overwrites_previous_snapshot() {
        let directory = InMemoryUserDirectory::new();

        let mut alice = UserRef::bare("alice");
        alice.username = "alice_w".to_string();
        directory.record(&alice).await.expect("record");

        alice.avatar_url = Some("https://cdn.example/alice.png".to_string());
        directory.record(&alice).await.expect("record again");

        let resolved = directory
            .resolve("alice")
            .await
            .expect("resolve")
            .expect("present");
        assert_eq!(resolved.username, "alice_w");
        assert!(resolved.avatar_url.is_some());

        assert!(directory.resolve("ghost").await.expect("resolve").is_none());
    }
}
