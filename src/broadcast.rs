use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::presence::{ConnectionSender, PresenceRegistry};

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

/// Fire-and-forget fan-out to connected agents. No delivery acknowledgement
/// flows back into the engine; a disconnected agent must never fail message
/// processing, so every failure here is logged and swallowed.
#[async_trait]
pub trait RealtimeBroadcaster: Send + Sync {
    async fn push_to_company(&self, company_id: &str, event: &str, data: serde_json::Value);
    async fn push_to_team(&self, team_id: &str, event: &str, data: serde_json::Value);
    async fn push_to_agent(&self, agent_id: &str, event: &str, data: serde_json::Value);
}

pub struct WsBroadcaster {
    presence: Arc<PresenceRegistry>,
}

impl WsBroadcaster {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    fn fan_out(senders: Vec<ConnectionSender>, event: &str, data: serde_json::Value) {
        let Some(payload) = event_payload(event, data) else {
            warn!(event, "failed to serialize broadcast payload");
            return;
        };
        for sender in senders {
            // Send errors mean the receiver task is gone; the presence purge
            // on its connection task will clean the entry up.
            let _ = sender.send(payload.clone());
        }
    }

    pub async fn push_to_connection(
        &self,
        connection_id: usize,
        event: &str,
        data: serde_json::Value,
    ) {
        let Some(sender) = self.presence.sender_for(connection_id).await else {
            return;
        };
        Self::fan_out(vec![sender], event, data);
    }
}

#[async_trait]
impl RealtimeBroadcaster for WsBroadcaster {
    async fn push_to_company(&self, company_id: &str, event: &str, data: serde_json::Value) {
        let senders = self.presence.senders_for_company(company_id).await;
        Self::fan_out(senders, event, data);
    }

    async fn push_to_team(&self, team_id: &str, event: &str, data: serde_json::Value) {
        let senders = self.presence.senders_for_team(team_id).await;
        Self::fan_out(senders, event, data);
    }

    async fn push_to_agent(&self, agent_id: &str, event: &str, data: serde_json::Value) {
        let senders = self.presence.senders_for_agent(agent_id).await;
        Self::fan_out(senders, event, data);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn envelope_has_event_and_data() {
        let payload = event_payload("message:new", json!({ "id": "m1" })).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["event"], "message:new");
        assert_eq!(parsed["data"]["id"], "m1");
    }

    #[tokio::test]
    async fn company_push_reaches_only_that_company() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = WsBroadcaster::new(presence.clone());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = presence.register(tx_a).await;
        let b = presence.register(tx_b).await;
        presence.authenticate(a, "agent-a", "c1", HashSet::new()).await;
        presence.authenticate(b, "agent-b", "c2", HashSet::new()).await;

        broadcaster
            .push_to_company("c1", "conversation:update", json!({ "id": "x" }))
            .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_to_dead_connection_is_silent() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = WsBroadcaster::new(presence.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let id = presence.register(tx).await;
        presence.authenticate(id, "agent-a", "c1", HashSet::new()).await;
        drop(rx);

        // Must not panic or error.
        broadcaster
            .push_to_company("c1", "message:new", json!({ "id": "m1" }))
            .await;
    }
}
