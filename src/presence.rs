use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{mpsc, Mutex};

pub type ConnectionSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct ConnectedAgent {
    pub user_id: String,
    pub company_id: String,
    pub team_ids: HashSet<String>,
}

struct ConnectionEntry {
    sender: ConnectionSender,
    agent: Option<ConnectedAgent>,
}

/// Process-wide map of live agent connections. Ephemeral: rebuilt as clients
/// reconnect after a restart. A socket registers on accept and becomes
/// addressable by company/team/agent only once `authenticate` runs; both the
/// upgrade and `purge` happen on the connection's own task, so a disconnect
/// can never leave a stale mapping visible to a later broadcast.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: Mutex<HashMap<usize, ConnectionEntry>>,
    next_connection_id: AtomicUsize,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sender: ConnectionSender) -> usize {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut connections = self.connections.lock().await;
        connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                agent: None,
            },
        );
        connection_id
    }

    pub async fn authenticate(
        &self,
        connection_id: usize,
        user_id: &str,
        company_id: &str,
        team_ids: HashSet<String>,
    ) {
        let mut connections = self.connections.lock().await;
        if let Some(entry) = connections.get_mut(&connection_id) {
            entry.agent = Some(ConnectedAgent {
                user_id: user_id.to_string(),
                company_id: company_id.to_string(),
                team_ids,
            });
        }
    }

    pub async fn purge(&self, connection_id: usize) {
        let mut connections = self.connections.lock().await;
        connections.remove(&connection_id);
    }

    pub async fn agent_for(&self, connection_id: usize) -> Option<ConnectedAgent> {
        let connections = self.connections.lock().await;
        connections
            .get(&connection_id)
            .and_then(|entry| entry.agent.clone())
    }

    pub async fn sender_for(&self, connection_id: usize) -> Option<ConnectionSender> {
        let connections = self.connections.lock().await;
        connections.get(&connection_id).map(|e| e.sender.clone())
    }

    pub async fn senders_for_company(&self, company_id: &str) -> Vec<ConnectionSender> {
        let connections = self.connections.lock().await;
        connections
            .values()
            .filter(|entry| {
                entry
                    .agent
                    .as_ref()
                    .map(|a| a.company_id == company_id)
                    .unwrap_or(false)
            })
            .map(|entry| entry.sender.clone())
            .collect()
    }

    pub async fn senders_for_team(&self, team_id: &str) -> Vec<ConnectionSender> {
        let connections = self.connections.lock().await;
        connections
            .values()
            .filter(|entry| {
                entry
                    .agent
                    .as_ref()
                    .map(|a| a.team_ids.contains(team_id))
                    .unwrap_or(false)
            })
            .map(|entry| entry.sender.clone())
            .collect()
    }

    pub async fn senders_for_agent(&self, user_id: &str) -> Vec<ConnectionSender> {
        let connections = self.connections.lock().await;
        connections
            .values()
            .filter(|entry| {
                entry
                    .agent
                    .as_ref()
                    .map(|a| a.user_id == user_id)
                    .unwrap_or(false)
            })
            .map(|entry| entry.sender.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team_set(teams: &[&str]) -> HashSet<String> {
        teams.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn unauthenticated_connections_are_not_addressable() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;

        assert!(registry.senders_for_company("c1").await.is_empty());
        assert!(registry.sender_for(id).await.is_some());
    }

    #[tokio::test]
    async fn addressing_by_company_team_and_agent() {
        let registry = PresenceRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;
        registry
            .authenticate(a, "agent-a", "c1", team_set(&["t1"]))
            .await;
        registry
            .authenticate(b, "agent-b", "c1", team_set(&["t2"]))
            .await;

        for sender in registry.senders_for_company("c1").await {
            let _ = sender.send("company".to_string());
        }
        assert_eq!(rx_a.recv().await.unwrap(), "company");
        assert_eq!(rx_b.recv().await.unwrap(), "company");

        for sender in registry.senders_for_team("t1").await {
            let _ = sender.send("team".to_string());
        }
        assert_eq!(rx_a.try_recv().unwrap(), "team");
        assert!(rx_b.try_recv().is_err());

        for sender in registry.senders_for_agent("agent-b").await {
            let _ = sender.send("direct".to_string());
        }
        assert_eq!(rx_b.try_recv().unwrap(), "direct");
    }

    #[tokio::test]
    async fn purge_removes_connection_from_all_groups() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;
        registry
            .authenticate(id, "agent-a", "c1", team_set(&["t1"]))
            .await;

        registry.purge(id).await;

        assert!(registry.senders_for_company("c1").await.is_empty());
        assert!(registry.senders_for_team("t1").await.is_empty());
        assert!(registry.senders_for_agent("agent-a").await.is_empty());
        assert!(registry.sender_for(id).await.is_none());
        assert!(registry.agent_for(id).await.is_none());
    }
}
