use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    AgentProfile, Channel, Conversation, ConversationState, ConversationSummary, DeliveryStatus,
    Direction, StoredMessage, TeamSummary,
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Repository contract the routing engine depends on. The engine never sees
/// SQL; it only requires that `find_or_create_conversation` is race-safe
/// (at most one active conversation per company + sender + channel) and that
/// `try_claim_for_agent` is a conditional write (first writer wins).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_or_create_conversation(
        &self,
        company_id: &str,
        external_sender_id: &str,
        sender_display_name: &str,
        channel: Channel,
    ) -> EngineResult<Conversation>;

    async fn get_conversation(&self, conversation_id: &str) -> EngineResult<Conversation>;

    async fn append_message(&self, message: StoredMessage) -> EngineResult<StoredMessage>;

    async fn find_message_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> EngineResult<Option<StoredMessage>>;

    async fn update_message_delivery(
        &self,
        message_id: &str,
        provider_message_id: Option<&str>,
        new_status: DeliveryStatus,
    ) -> EngineResult<StoredMessage>;

    /// Unconditional state/assignment write. `state == Archived` also clears
    /// `is_active` so the sender's next inbound opens a fresh conversation.
    async fn update_conversation_state(
        &self,
        conversation_id: &str,
        new_state: ConversationState,
        assigned_agent_id: Option<&str>,
        assigned_team_id: Option<&str>,
    ) -> EngineResult<Conversation>;

    /// Conditional assignment: succeeds only while no agent holds the
    /// conversation and it is not archived.
    async fn try_claim_for_agent(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> EngineResult<Conversation>;

    /// Chronological, oldest first, capped at `limit` most recent.
    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<StoredMessage>>;

    async fn list_conversations(&self, company_id: &str)
        -> EngineResult<Vec<ConversationSummary>>;
}

/// Directory lookups for the HTTP/WS surface. Token issuance is external;
/// this only reads what the identity service wrote.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find_agent_by_token(&self, token: &str) -> EngineResult<Option<AgentProfile>>;

    async fn get_team(&self, team_id: &str) -> EngineResult<Option<TeamSummary>>;

    async fn list_teams(&self, company_id: &str) -> EngineResult<Vec<TeamSummary>>;
}

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_conversation_row(row: sqlx::postgres::PgRow) -> Conversation {
    let channel: String = row.get("channel");
    let state: String = row.get("state");
    Conversation {
        id: row.get("id"),
        company_id: row.get("company_id"),
        external_sender_id: row.get("external_sender_id"),
        sender_display_name: row.get("sender_display_name"),
        channel: Channel::parse(&channel).unwrap_or(Channel::Whatsapp),
        state: ConversationState::parse(&state).unwrap_or(ConversationState::Unassigned),
        assigned_agent_id: row.get("assigned_agent_id"),
        assigned_team_id: row.get("assigned_team_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        is_active: row.get("is_active"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> StoredMessage {
    let direction: String = row.get("direction");
    let status: String = row.get("delivery_status");
    StoredMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        direction: Direction::parse(&direction).unwrap_or(Direction::Inbound),
        provider_message_id: row.get("provider_message_id"),
        text: row.get("text"),
        sender_id: row.get("sender_id"),
        sender_display_name: row.get("sender_display_name"),
        sent_at: row.get("sent_at"),
        delivery_status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Pending),
        status_changed_at: row.get("status_changed_at"),
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn find_or_create_conversation(
        &self,
        company_id: &str,
        external_sender_id: &str,
        sender_display_name: &str,
        channel: Channel,
    ) -> EngineResult<Conversation> {
        let existing = sqlx::query(
            "SELECT * FROM conversations \
             WHERE company_id = $1 AND external_sender_id = $2 AND channel = $3 AND is_active \
             LIMIT 1",
        )
        .bind(company_id)
        .bind(external_sender_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        if let Some(row) = existing {
            return Ok(parse_conversation_row(row));
        }

        let now = now_iso();
        let inserted = sqlx::query(
            "INSERT INTO conversations \
             (id, company_id, external_sender_id, sender_display_name, channel, state, \
              assigned_agent_id, assigned_team_id, created_at, updated_at, is_active) \
             VALUES ($1, $2, $3, $4, $5, 'unassigned', NULL, NULL, $6, $6, TRUE) \
             ON CONFLICT (company_id, external_sender_id, channel) WHERE is_active \
             DO NOTHING \
             RETURNING *",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(company_id)
        .bind(external_sender_id)
        .bind(sender_display_name)
        .bind(channel.as_str())
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        if let Some(row) = inserted {
            return Ok(parse_conversation_row(row));
        }

        // Lost the insert race; the winner's row must exist now.
        let row = sqlx::query(
            "SELECT * FROM conversations \
             WHERE company_id = $1 AND external_sender_id = $2 AND channel = $3 AND is_active \
             LIMIT 1",
        )
        .bind(company_id)
        .bind(external_sender_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        row.map(parse_conversation_row)
            .ok_or_else(|| EngineError::storage("conversation vanished after conflict"))
    }

    async fn get_conversation(&self, conversation_id: &str) -> EngineResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::storage)?;
        row.map(parse_conversation_row)
            .ok_or_else(|| EngineError::not_found("conversation", conversation_id))
    }

    async fn append_message(&self, message: StoredMessage) -> EngineResult<StoredMessage> {
        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, direction, provider_message_id, text, sender_id, \
              sender_display_name, sent_at, delivery_status, status_changed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.direction.as_str())
        .bind(&message.provider_message_id)
        .bind(&message.text)
        .bind(&message.sender_id)
        .bind(&message.sender_display_name)
        .bind(&message.sent_at)
        .bind(message.delivery_status.as_str())
        .bind(&message.status_changed_at)
        .execute(&self.pool)
        .await
        .map_err(EngineError::storage)?;

        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(now_iso())
            .bind(&message.conversation_id)
            .execute(&self.pool)
            .await
            .map_err(EngineError::storage)?;

        Ok(message)
    }

    async fn find_message_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> EngineResult<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT m.* FROM messages m \
             JOIN conversations c ON c.id = m.conversation_id \
             WHERE m.provider_message_id = $1 AND c.channel = $2 \
             LIMIT 1",
        )
        .bind(provider_message_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        Ok(row.map(parse_message_row))
    }

    async fn update_message_delivery(
        &self,
        message_id: &str,
        provider_message_id: Option<&str>,
        new_status: DeliveryStatus,
    ) -> EngineResult<StoredMessage> {
        let row = sqlx::query(
            "UPDATE messages \
             SET provider_message_id = COALESCE($1, provider_message_id), \
                 delivery_status = $2, status_changed_at = $3 \
             WHERE id = $4 \
             RETURNING *",
        )
        .bind(provider_message_id)
        .bind(new_status.as_str())
        .bind(now_iso())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        row.map(parse_message_row)
            .ok_or_else(|| EngineError::not_found("message", message_id))
    }

    async fn update_conversation_state(
        &self,
        conversation_id: &str,
        new_state: ConversationState,
        assigned_agent_id: Option<&str>,
        assigned_team_id: Option<&str>,
    ) -> EngineResult<Conversation> {
        let row = sqlx::query(
            "UPDATE conversations \
             SET state = $1, assigned_agent_id = $2, assigned_team_id = $3, \
                 is_active = $4, updated_at = $5 \
             WHERE id = $6 \
             RETURNING *",
        )
        .bind(new_state.as_str())
        .bind(assigned_agent_id)
        .bind(assigned_team_id)
        .bind(new_state != ConversationState::Archived)
        .bind(now_iso())
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        row.map(parse_conversation_row)
            .ok_or_else(|| EngineError::not_found("conversation", conversation_id))
    }

    async fn try_claim_for_agent(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> EngineResult<Conversation> {
        let row = sqlx::query(
            "UPDATE conversations \
             SET state = 'assigned_agent', assigned_agent_id = $1, assigned_team_id = NULL, \
                 updated_at = $2 \
             WHERE id = $3 AND assigned_agent_id IS NULL AND state != 'archived' \
             RETURNING *",
        )
        .bind(agent_id)
        .bind(now_iso())
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        if let Some(row) = row {
            return Ok(parse_conversation_row(row));
        }

        // Distinguish "lost the race" from "no such conversation".
        let current = self.get_conversation(conversation_id).await?;
        if current.state == ConversationState::Archived {
            return Err(EngineError::ConversationClosed {
                conversation_id: conversation_id.to_string(),
            });
        }
        Err(EngineError::ConversationAlreadyAssigned {
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM ( \
               SELECT * FROM messages WHERE conversation_id = $1 \
               ORDER BY sent_at DESC LIMIT $2 \
             ) latest ORDER BY sent_at ASC",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        Ok(rows.into_iter().map(parse_message_row).collect())
    }

    async fn list_conversations(
        &self,
        company_id: &str,
    ) -> EngineResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE company_id = $1 ORDER BY updated_at DESC",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::storage)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = parse_conversation_row(row);
            let last = sqlx::query(
                "SELECT * FROM messages WHERE conversation_id = $1 \
                 ORDER BY sent_at DESC LIMIT 1",
            )
            .bind(&conversation.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::storage)?;
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
                    .bind(&conversation.id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EngineError::storage)?;
            summaries.push(summarize(conversation, last.map(parse_message_row), count as usize));
        }
        Ok(summaries)
    }
}

#[async_trait]
impl AgentDirectory for PgConversationStore {
    async fn find_agent_by_token(&self, token: &str) -> EngineResult<Option<AgentProfile>> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.email, a.company_id, a.team_ids \
             FROM auth_tokens t JOIN agents a ON a.id = t.agent_id \
             WHERE t.token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::storage)?;
        Ok(row.map(|row| AgentProfile {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            company_id: row.get("company_id"),
            team_ids: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("team_ids"))
                .unwrap_or_default(),
        }))
    }

    async fn get_team(&self, team_id: &str) -> EngineResult<Option<TeamSummary>> {
        let row = sqlx::query("SELECT id, company_id, name FROM teams WHERE id = $1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::storage)?;
        Ok(row.map(|row| TeamSummary {
            id: row.get("id"),
            company_id: row.get("company_id"),
            name: row.get("name"),
        }))
    }

    async fn list_teams(&self, company_id: &str) -> EngineResult<Vec<TeamSummary>> {
        let rows =
            sqlx::query("SELECT id, company_id, name FROM teams WHERE company_id = $1 ORDER BY name")
                .bind(company_id)
                .fetch_all(&self.pool)
                .await
                .map_err(EngineError::storage)?;
        Ok(rows
            .into_iter()
            .map(|row| TeamSummary {
                id: row.get("id"),
                company_id: row.get("company_id"),
                name: row.get("name"),
            })
            .collect())
    }
}

fn summarize(
    conversation: Conversation,
    last_message: Option<StoredMessage>,
    message_count: usize,
) -> ConversationSummary {
    ConversationSummary {
        id: conversation.id,
        company_id: conversation.company_id,
        external_sender_id: conversation.external_sender_id,
        sender_display_name: conversation.sender_display_name,
        channel: conversation.channel,
        state: conversation.state,
        assigned_agent_id: conversation.assigned_agent_id,
        assigned_team_id: conversation.assigned_team_id,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
        last_message,
        message_count,
    }
}

#[derive(Default)]
struct MemoryInner {
    conversations: HashMap<String, Conversation>,
    messages: Vec<StoredMessage>,
    agents_by_token: HashMap<String, AgentProfile>,
    teams: HashMap<String, TeamSummary>,
}

/// In-memory store used by tests and DATABASE_URL-less local runs. One lock
/// over everything keeps find-or-create and claim conditional writes atomic.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_agent_token(&self, token: &str, profile: AgentProfile) {
        let mut inner = self.inner.lock().await;
        inner.agents_by_token.insert(token.to_string(), profile);
    }

    pub async fn insert_team(&self, team: TeamSummary) {
        let mut inner = self.inner.lock().await;
        inner.teams.insert(team.id.clone(), team);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn find_or_create_conversation(
        &self,
        company_id: &str,
        external_sender_id: &str,
        sender_display_name: &str,
        channel: Channel,
    ) -> EngineResult<Conversation> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.conversations.values().find(|c| {
            c.is_active
                && c.company_id == company_id
                && c.external_sender_id == external_sender_id
                && c.channel == channel
        }) {
            return Ok(existing.clone());
        }
        let now = now_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            external_sender_id: external_sender_id.to_string(),
            sender_display_name: sender_display_name.to_string(),
            channel,
            state: ConversationState::Unassigned,
            assigned_agent_id: None,
            assigned_team_id: None,
            created_at: now.clone(),
            updated_at: now,
            is_active: true,
        };
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> EngineResult<Conversation> {
        let inner = self.inner.lock().await;
        inner
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("conversation", conversation_id))
    }

    async fn append_message(&self, message: StoredMessage) -> EngineResult<StoredMessage> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(EngineError::not_found(
                "conversation",
                message.conversation_id.clone(),
            ));
        }
        inner.messages.push(message.clone());
        if let Some(conversation) = inner.conversations.get_mut(&message.conversation_id) {
            conversation.updated_at = now_iso();
        }
        Ok(message)
    }

    async fn find_message_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> EngineResult<Option<StoredMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .find(|m| {
                m.provider_message_id.as_deref() == Some(provider_message_id)
                    && inner
                        .conversations
                        .get(&m.conversation_id)
                        .map(|c| c.channel == channel)
                        .unwrap_or(false)
            })
            .cloned())
    }

    async fn update_message_delivery(
        &self,
        message_id: &str,
        provider_message_id: Option<&str>,
        new_status: DeliveryStatus,
    ) -> EngineResult<StoredMessage> {
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| EngineError::not_found("message", message_id))?;
        if let Some(pid) = provider_message_id {
            message.provider_message_id = Some(pid.to_string());
        }
        message.delivery_status = new_status;
        message.status_changed_at = now_iso();
        Ok(message.clone())
    }

    async fn update_conversation_state(
        &self,
        conversation_id: &str,
        new_state: ConversationState,
        assigned_agent_id: Option<&str>,
        assigned_team_id: Option<&str>,
    ) -> EngineResult<Conversation> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| EngineError::not_found("conversation", conversation_id))?;
        conversation.state = new_state;
        conversation.assigned_agent_id = assigned_agent_id.map(str::to_string);
        conversation.assigned_team_id = assigned_team_id.map(str::to_string);
        conversation.is_active = new_state != ConversationState::Archived;
        conversation.updated_at = now_iso();
        Ok(conversation.clone())
    }

    async fn try_claim_for_agent(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> EngineResult<Conversation> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| EngineError::not_found("conversation", conversation_id))?;
        if conversation.state == ConversationState::Archived {
            return Err(EngineError::ConversationClosed {
                conversation_id: conversation_id.to_string(),
            });
        }
        if conversation.assigned_agent_id.is_some() {
            return Err(EngineError::ConversationAlreadyAssigned {
                conversation_id: conversation_id.to_string(),
            });
        }
        conversation.state = ConversationState::AssignedAgent;
        conversation.assigned_agent_id = Some(agent_id.to_string());
        conversation.assigned_team_id = None;
        conversation.updated_at = now_iso();
        Ok(conversation.clone())
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<StoredMessage>> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn list_conversations(
        &self,
        company_id: &str,
    ) -> EngineResult<Vec<ConversationSummary>> {
        let inner = self.inner.lock().await;
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter(|c| c.company_id == company_id)
            .map(|c| {
                let mut last: Option<&StoredMessage> = None;
                let mut count = 0usize;
                for message in inner.messages.iter().filter(|m| m.conversation_id == c.id) {
                    count += 1;
                    last = Some(message);
                }
                summarize(c.clone(), last.cloned(), count)
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[async_trait]
impl AgentDirectory for MemoryConversationStore {
    async fn find_agent_by_token(&self, token: &str) -> EngineResult<Option<AgentProfile>> {
        let inner = self.inner.lock().await;
        Ok(inner.agents_by_token.get(token).cloned())
    }

    async fn get_team(&self, team_id: &str) -> EngineResult<Option<TeamSummary>> {
        let inner = self.inner.lock().await;
        Ok(inner.teams.get(team_id).cloned())
    }

    async fn list_teams(&self, company_id: &str) -> EngineResult<Vec<TeamSummary>> {
        let inner = self.inner.lock().await;
        let mut teams: Vec<TeamSummary> = inner
            .teams
            .values()
            .filter(|t| t.company_id == company_id)
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(conversation_id: &str, provider_id: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Inbound,
            provider_message_id: Some(provider_id.to_string()),
            text: "hello".to_string(),
            sender_id: "u1".to_string(),
            sender_display_name: "U One".to_string(),
            sent_at: now_iso(),
            delivery_status: DeliveryStatus::Received,
            status_changed_at: now_iso(),
        }
    }

    #[tokio::test]
    async fn find_or_create_reuses_active_conversation() {
        let store = MemoryConversationStore::new();
        let first = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        let second = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // Different channel gets its own conversation.
        let messenger = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Messenger)
            .await
            .unwrap();
        assert_ne!(first.id, messenger.id);
    }

    #[tokio::test]
    async fn archived_conversation_is_not_reused() {
        let store = MemoryConversationStore::new();
        let first = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        store
            .update_conversation_state(&first.id, ConversationState::Archived, None, None)
            .await
            .unwrap();
        let fresh = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        assert_ne!(first.id, fresh.id);
        assert_eq!(fresh.state, ConversationState::Unassigned);
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = MemoryConversationStore::new();
        let conversation = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        let won = store
            .try_claim_for_agent(&conversation.id, "agent-a")
            .await
            .unwrap();
        assert_eq!(won.state, ConversationState::AssignedAgent);
        assert_eq!(won.assigned_agent_id.as_deref(), Some("agent-a"));

        let lost = store.try_claim_for_agent(&conversation.id, "agent-b").await;
        assert!(matches!(
            lost,
            Err(EngineError::ConversationAlreadyAssigned { .. })
        ));
    }

    #[tokio::test]
    async fn provider_id_lookup_is_scoped_to_channel() {
        let store = MemoryConversationStore::new();
        let conversation = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        store
            .append_message(inbound(&conversation.id, "m1"))
            .await
            .unwrap();

        let hit = store
            .find_message_by_provider_id(Channel::Whatsapp, "m1")
            .await
            .unwrap();
        assert!(hit.is_some());
        let miss = store
            .find_message_by_provider_id(Channel::Messenger, "m1")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn recent_messages_are_chronological_and_capped() {
        let store = MemoryConversationStore::new();
        let conversation = store
            .find_or_create_conversation("c1", "u1", "U One", Channel::Whatsapp)
            .await
            .unwrap();
        for i in 0..5 {
            let mut message = inbound(&conversation.id, &format!("m{i}"));
            message.sent_at = format!("2026-01-01T00:00:0{i}Z");
            store.append_message(message).await.unwrap();
        }
        let recent = store.get_recent_messages(&conversation.id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        let ids: Vec<_> = recent
            .iter()
            .map(|m| m.provider_message_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }
}
