use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

/// Online/offline edge signal. Fired exactly once per true transition, never
/// for a connection added to or removed from an already-online user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceUpdate {
    CameOnline(String),
    WentOffline(String),
}

/// Registry of which users currently have at least one live connection. A
/// user may hold several connections at once (multiple devices or tabs); the
/// entry exists exactly while its connection set is non-empty. Mutations go
/// through a single serialized registry lock so edge signals cannot race.
#[derive(Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<String, HashSet<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, user_id: &str, connection_id: &str) -> Option<PresenceUpdate> {
        let mut entries = self.entries.write().await;
        let connections = entries.entry(user_id.to_string()).or_default();
        let was_offline = connections.is_empty();
        connections.insert(connection_id.to_string());
        if was_offline {
            Some(PresenceUpdate::CameOnline(user_id.to_string()))
        } else {
            None
        }
    }

    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> Option<PresenceUpdate> {
        let mut entries = self.entries.write().await;
        let Some(connections) = entries.get_mut(user_id) else {
            return None;
        };
        connections.remove(connection_id);
        if connections.is_empty() {
            entries.remove(user_id);
            Some(PresenceUpdate::WentOffline(user_id.to_string()))
        } else {
            None
        }
    }

    /// Snapshot of online users, optionally without the caller. Sorted for a
    /// stable wire representation.
    pub async fn list_online(&self, excluding: Option<&str>) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut online: Vec<String> = entries
            .iter()
            .filter(|(user_id, connections)| {
                !connections.is_empty() && Some(user_id.as_str()) != excluding
            })
            .map(|(user_id, _)| user_id.clone())
            .collect();
        online.sort();
        online
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_connection_emits_online_edge_only_once() {
        let tracker = PresenceTracker::new();

        let first = tracker.connect("alice", "conn-1").await;
        assert_eq!(first, Some(PresenceUpdate::CameOnline("alice".into())));

        let second = tracker.connect("alice", "conn-2").await;
        assert_eq!(second, None);

        assert!(tracker.is_online("alice").await);
    }

    #[tokio::test]
    async fn multi_device_user_stays_online_until_last_disconnect() {
        let tracker = PresenceTracker::new();
        tracker.connect("alice", "conn-1").await;
        tracker.connect("alice", "conn-2").await;

        assert_eq!(tracker.list_online(Some("bob")).await, vec!["alice"]);

        assert_eq!(tracker.disconnect("alice", "conn-1").await, None);
        assert_eq!(tracker.list_online(Some("bob")).await, vec!["alice"]);

        let offline = tracker.disconnect("alice", "conn-2").await;
        assert_eq!(offline, Some(PresenceUpdate::WentOffline("alice".into())));
        assert!(tracker.list_online(Some("bob")).await.is_empty());
        assert!(!tracker.is_online("alice").await);
    }

    #[tokio::test]
    async fn list_online_excludes_caller_and_sorts() {
        let tracker = PresenceTracker::new();
        tracker.connect("carol", "c-1").await;
        tracker.connect("alice", "a-1").await;
        tracker.connect("bob", "b-1").await;

        assert_eq!(tracker.list_online(Some("bob")).await, vec!["alice", "carol"]);
        assert_eq!(
            tracker.list_online(None).await,
            vec!["alice", "bob", "carol"]
        );
    }

    #[tokio::test]
    async fn disconnect_of_unknown_connection_is_a_noop() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.disconnect("ghost", "conn-1").await, None);

        tracker.connect("alice", "conn-1").await;
        assert_eq!(tracker.disconnect("alice", "other-conn").await, None);
        assert!(tracker.is_online("alice").await);
    }
}
